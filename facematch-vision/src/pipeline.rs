use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;

use crate::{align, detect, encode, Detection};

/// A detected face together with its descriptor.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub detection: Detection,
    pub descriptor: Vec<f32>,
}

/// Full pipeline: detect faces → align → encode
pub struct Pipeline {
    detector: Session,
    encoder: Session,
    score_threshold: f32,
    nms_iou: f32,
}

impl Pipeline {
    pub fn from_paths(detector: &Path, encoder: &Path) -> Result<Self> {
        Ok(Self {
            detector: crate::model::detector_session(detector)?,
            encoder: crate::model::encoder_session(encoder)?,
            score_threshold: 0.6,
            nms_iou: 0.3,
        })
    }

    pub fn with_thresholds(mut self, score_threshold: f32, nms_iou: f32) -> Self {
        self.score_threshold = score_threshold;
        self.nms_iou = nms_iou;
        self
    }

    pub fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>> {
        detect::detect_faces(&mut self.detector, img, self.score_threshold, self.nms_iou)
            .context("detecting faces")
    }

    pub fn describe(&mut self, img: &DynamicImage, detection: &Detection) -> Result<Vec<f32>> {
        let face = align::align_face(img, detection, encode::FACE_SIZE).context("aligning face")?;
        encode::encode_face(&mut self.encoder, &face).context("encoding face")
    }

    /// Highest-scoring face in the image, or `None` when nothing is detected.
    pub fn best_face(&mut self, img: &DynamicImage) -> Result<Option<FaceSample>> {
        let best = self
            .detect(img)?
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score));

        match best {
            Some(detection) => {
                let descriptor = self.describe(img, &detection)?;
                Ok(Some(FaceSample {
                    detection,
                    descriptor,
                }))
            }
            None => Ok(None),
        }
    }

    /// Every face in the image. Faces that fail to align are skipped.
    pub fn all_faces(&mut self, img: &DynamicImage) -> Result<Vec<FaceSample>> {
        let detections = self.detect(img)?;
        let mut out = Vec::with_capacity(detections.len());
        for detection in detections {
            match self.describe(img, &detection) {
                Ok(descriptor) => out.push(FaceSample {
                    detection,
                    descriptor,
                }),
                Err(e) => log::warn!("skipping face at {:?}: {:#}", detection.bbox, e),
            }
        }
        Ok(out)
    }
}
