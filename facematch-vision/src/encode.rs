use anyhow::{Context, Result};
use image::DynamicImage;
use ort::{session::Session, value::Value};

use crate::detect::bgr_planes;

/// Side of the aligned face crop fed to the encoder.
pub const FACE_SIZE: u32 = 112;

/// Run the recognition model on an aligned crop and return an L2-normalised
/// descriptor.
pub fn encode_face(session: &mut Session, face: &DynamicImage) -> Result<Vec<f32>> {
    let rgb = face
        .resize_exact(FACE_SIZE, FACE_SIZE, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let input = Value::from_array(bgr_planes(&rgb, FACE_SIZE)?)?;

    let outputs = session.run(ort::inputs![input]).context("running encoder")?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    let dims = match shape.len() {
        2 => shape[1] as usize,
        _ => data.len(),
    };
    if dims == 0 || dims > data.len() {
        anyhow::bail!(
            "encoder returned an unusable shape {:?}",
            shape.iter().collect::<Vec<_>>()
        );
    }

    Ok(l2_normalize(data[..dims].to_vec()))
}

/// Scale `v` to unit length; the zero vector is returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}
