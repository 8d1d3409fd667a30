//! Face detector post-processing.
//!
//! The detector is a YuNet-style anchor-free network. For every stride in
//! [`STRIDES`] it emits four heads over an `n × n` grid (`n = input / stride`):
//! `cls [1, n*n, 1]`, `obj [1, n*n, 1]`, `bbox [1, n*n, 4]` and
//! `kps [1, n*n, 10]`, in the order `cls_*, obj_*, bbox_*, kps_*`.
//!
//! Grid cell `(row, col)` decodes as
//! `cx = (col + dx) * stride`, `cy = (row + dy) * stride`,
//! `w = dw * stride`, `h = dh * stride`, landmarks likewise.

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{Array2, Array4, ArrayView2};
use ort::{session::Session, value::Value};

pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Side of the square canvas the detector runs on.
pub const INPUT_SIZE: u32 = 640;

/// A detected face in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// x, y, w, h
    pub bbox: [f32; 4],
    pub score: f32,
    /// Five points: left eye, right eye, nose, left mouth, right mouth.
    pub landmarks: [f32; 10],
}

/// One scale of detector output, already flattened to `[cells, channels]`.
pub struct ScaleHeads<'a> {
    pub stride: usize,
    pub cls: ArrayView2<'a, f32>,
    pub obj: ArrayView2<'a, f32>,
    pub bbox: ArrayView2<'a, f32>,
    pub kps: ArrayView2<'a, f32>,
}

/// Letterbox geometry used to map canvas coordinates back to the source image.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn unmap_x(&self, x: f32) -> f32 {
        (x - self.offset_x) / self.scale
    }

    fn unmap_y(&self, y: f32) -> f32 {
        (y - self.offset_y) / self.scale
    }
}

/// Run the detector on `img` and return faces above `score_threshold`,
/// suppressed with `nms_iou` (pass `1.0` or more to keep everything).
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_iou: f32,
) -> Result<Vec<Detection>> {
    let (canvas, letterbox) = letterbox(img, INPUT_SIZE);
    let input = Value::from_array(bgr_planes(&canvas, INPUT_SIZE)?)?;

    let outputs = session.run(ort::inputs![input]).context("running detector")?;

    let mut tensors: Vec<(Vec<i64>, Vec<f32>)> = Vec::with_capacity(12);
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        tensors.push((shape.iter().copied().collect(), data.to_vec()));
    }

    let arrays = heads_from_tensors(&tensors, INPUT_SIZE as usize)?;
    let heads: Vec<ScaleHeads<'_>> = STRIDES
        .iter()
        .enumerate()
        .map(|(i, &stride)| ScaleHeads {
            stride,
            cls: arrays[i].view(),
            obj: arrays[i + 3].view(),
            bbox: arrays[i + 6].view(),
            kps: arrays[i + 9].view(),
        })
        .collect();

    let size = INPUT_SIZE as f32;
    let mut detections: Vec<Detection> = decode(&heads, INPUT_SIZE as usize, score_threshold)?
        .into_iter()
        .map(|d| {
            let mut landmarks = [0.0f32; 10];
            for k in 0..5 {
                landmarks[k * 2] = letterbox.unmap_x(d.landmarks[k * 2] * size);
                landmarks[k * 2 + 1] = letterbox.unmap_y(d.landmarks[k * 2 + 1] * size);
            }
            Detection {
                bbox: [
                    letterbox.unmap_x(d.bbox[0] * size),
                    letterbox.unmap_y(d.bbox[1] * size),
                    d.bbox[2] * size / letterbox.scale,
                    d.bbox[3] * size / letterbox.scale,
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    if nms_iou < 1.0 {
        detections = nms(detections, nms_iou);
    }
    log::debug!("detector kept {} face(s)", detections.len());

    Ok(detections)
}

/// Pad `img` onto a black square canvas of side `size`, preserving aspect.
fn letterbox(img: &DynamicImage, size: u32) -> (image::RgbImage, Letterbox) {
    let (w, h) = img.dimensions();
    let scale = size as f32 / w.max(h) as f32;
    let new_w = ((w as f32 * scale) as u32).clamp(1, size);
    let new_h = ((h as f32 * scale) as u32).clamp(1, size);
    let resized = img
        .resize_exact(new_w, new_h, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let offset_x = (size - new_w) / 2;
    let offset_y = (size - new_h) / 2;
    let mut canvas = image::RgbImage::new(size, size);
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            offset_x: offset_x as f32,
            offset_y: offset_y as f32,
        },
    )
}

/// Convert an RGB image to a `[1, 3, size, size]` BGR planar tensor in `[0, 255]`.
pub(crate) fn bgr_planes(rgb: &image::RgbImage, size: u32) -> Result<Array4<f32>> {
    let plane = (size * size) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    let (b, rest) = data.split_at_mut(plane);
    let (g, r) = rest.split_at_mut(plane);
    for (i, px) in rgb.as_raw().chunks_exact(3).take(plane).enumerate() {
        r[i] = px[0] as f32;
        g[i] = px[1] as f32;
        b[i] = px[2] as f32;
    }
    Ok(Array4::from_shape_vec(
        (1, 3, size as usize, size as usize),
        data,
    )?)
}

/// Validate the twelve raw output tensors and reshape them to `[cells, channels]`.
///
/// The result is indexed like the model output: `cls` at 0..3, `obj` at 3..6,
/// `bbox` at 6..9 and `kps` at 9..12.
pub fn heads_from_tensors(
    tensors: &[(Vec<i64>, Vec<f32>)],
    input_size: usize,
) -> Result<Vec<Array2<f32>>> {
    const HEADS: [(&str, usize); 4] = [("cls", 1), ("obj", 1), ("bbox", 4), ("kps", 10)];

    if tensors.len() < 12 {
        anyhow::bail!("detector produced {} outputs, expected 12", tensors.len());
    }

    let mut arrays = Vec::with_capacity(12);
    for (head_idx, (head, channels)) in HEADS.iter().enumerate() {
        for (scale_idx, stride) in STRIDES.iter().enumerate() {
            let idx = head_idx * STRIDES.len() + scale_idx;
            let (shape, data) = &tensors[idx];
            let cells = (input_size / stride).pow(2);
            let expected = [1, cells as i64, *channels as i64];
            if shape.as_slice() != expected.as_slice() {
                anyhow::bail!(
                    "unexpected {} shape at output {}: {:?}, expected {:?}",
                    head,
                    idx,
                    shape,
                    expected
                );
            }
            arrays.push(Array2::from_shape_vec((cells, *channels), data.clone())?);
        }
    }
    Ok(arrays)
}

/// Decode all scales into detections normalised to `[0, 1]` of the canvas.
///
/// The heads are already probabilities; the face score is the geometric
/// mean `sqrt(cls * obj)` with both clamped to `[0, 1]`.
pub fn decode(
    heads: &[ScaleHeads<'_>],
    input_size: usize,
    score_threshold: f32,
) -> Result<Vec<Detection>> {
    let size = input_size as f32;
    let mut out = Vec::new();

    for scale in heads {
        let n = input_size / scale.stride;
        let cells = scale.cls.nrows();
        if cells != n * n {
            anyhow::bail!(
                "stride {} expects a {}x{} grid, got {} cells",
                scale.stride,
                n,
                n,
                cells
            );
        }
        let stride = scale.stride as f32;

        for row in 0..n {
            for col in 0..n {
                let idx = row * n + col;
                let cls = scale.cls[[idx, 0]].clamp(0.0, 1.0);
                let obj = scale.obj[[idx, 0]].clamp(0.0, 1.0);
                let score = (cls * obj).sqrt();
                if score < score_threshold {
                    continue;
                }

                let cx = (col as f32 + scale.bbox[[idx, 0]]) * stride / size;
                let cy = (row as f32 + scale.bbox[[idx, 1]]) * stride / size;
                let w = scale.bbox[[idx, 2]] * stride / size;
                let h = scale.bbox[[idx, 3]] * stride / size;

                let mut landmarks = [0.0f32; 10];
                for k in 0..5 {
                    landmarks[k * 2] = (col as f32 + scale.kps[[idx, k * 2]]) * stride / size;
                    landmarks[k * 2 + 1] =
                        (row as f32 + scale.kps[[idx, k * 2 + 1]]) * stride / size;
                }

                out.push(Detection {
                    bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                    score,
                    landmarks,
                });
            }
        }
    }

    Ok(out)
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| iou(&k.bbox, &det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}
