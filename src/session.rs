//! Capture sessions.
//!
//! A [`RecognitionSession`] holds everything one recognition run needs: the
//! vision pipeline, a snapshot of known faces and the threshold. The caller
//! drives it one frame at a time with [`RecognitionSession::step`].

use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use log::{debug, info, warn};

use crate::error::MatchError;
use crate::matcher::{self, Candidate, MatchResult};
use crate::storage::FaceRecord;
use crate::{Camera, Detection, FaceSample, Pipeline};

/// Largest side of a stored thumbnail.
pub const THUMBNAIL_SIZE: u32 = 96;

const FRAME_DELAY: Duration = Duration::from_millis(100);

/// Anything that yields frames: a camera, or a single still image.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<RgbImage>;

    /// Whether waiting between frames makes sense for this source.
    fn is_live(&self) -> bool {
        true
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<RgbImage> {
        self.frame()
    }
}

/// A still image served as a one-frame source.
pub struct StillImage(pub RgbImage);

impl FrameSource for StillImage {
    fn next_frame(&mut self) -> Result<RgbImage> {
        Ok(self.0.clone())
    }

    fn is_live(&self) -> bool {
        false
    }
}

/// Per-frame face extraction, implemented by [`Pipeline`].
pub trait FaceScanner {
    /// Highest-scoring face in `img`, if any.
    fn best_face(&mut self, img: &DynamicImage) -> Result<Option<FaceSample>>;

    /// Every face in `img`.
    fn all_faces(&mut self, img: &DynamicImage) -> Result<Vec<FaceSample>>;
}

impl FaceScanner for Pipeline {
    fn best_face(&mut self, img: &DynamicImage) -> Result<Option<FaceSample>> {
        Pipeline::best_face(self, img)
    }

    fn all_faces(&mut self, img: &DynamicImage) -> Result<Vec<FaceSample>> {
        Pipeline::all_faces(self, img)
    }
}

/// A labelled face in one frame.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub detection: Detection,
    pub result: MatchResult,
}

impl Recognition {
    pub fn label(&self) -> String {
        self.result.label()
    }
}

/// Label each detected face against `known`.
pub fn label_faces<C: Candidate>(
    faces: Vec<FaceSample>,
    known: &[C],
    threshold: f32,
) -> Result<Vec<Recognition>, MatchError> {
    faces
        .into_iter()
        .map(|face| {
            let result = matcher::match_face(&face.descriptor, known, threshold)?;
            Ok(Recognition {
                detection: face.detection,
                result,
            })
        })
        .collect()
}

pub struct RecognitionSession<P = Pipeline> {
    pipeline: P,
    known: Vec<FaceRecord>,
    threshold: f32,
}

impl<P: FaceScanner> RecognitionSession<P> {
    pub fn new(pipeline: P, known: Vec<FaceRecord>, threshold: f32) -> Self {
        Self {
            pipeline,
            known,
            threshold,
        }
    }

    /// Replace the snapshot of known faces.
    pub fn refresh(&mut self, known: Vec<FaceRecord>) {
        info!("known faces refreshed: {}", known.len());
        self.known = known;
    }

    pub fn known(&self) -> &[FaceRecord] {
        &self.known
    }

    /// Detect and label every face in `frame`.
    pub fn step(&mut self, frame: &DynamicImage) -> Result<Vec<Recognition>> {
        let faces = self.pipeline.all_faces(frame)?;
        debug!("{} face(s) in frame", faces.len());
        label_faces(faces, &self.known, self.threshold).context("matching faces")
    }

    /// Step through up to `max_frames` frames, stopping at the first frame in
    /// which some face matched. Returns the recognitions of that frame.
    ///
    /// A frame the pipeline fails on is skipped. A [`MatchError`] ends the run.
    pub fn run<S: FrameSource>(
        &mut self,
        source: &mut S,
        max_frames: u32,
    ) -> Result<Option<Vec<Recognition>>> {
        for i in 0..max_frames {
            let frame = DynamicImage::ImageRgb8(source.next_frame().context("capture frame")?);
            match self.pipeline.all_faces(&frame) {
                Ok(faces) => {
                    let found =
                        label_faces(faces, &self.known, self.threshold).context("matching faces")?;
                    for r in &found {
                        info!(
                            "Frame {}: {} (distance {:.3})",
                            i + 1,
                            r.label(),
                            r.result.distance
                        );
                    }
                    if found.iter().any(|r| r.result.matched) {
                        return Ok(Some(found));
                    }
                }
                Err(e) => warn!("Frame {}: {:#}", i + 1, e),
            }
            if !source.is_live() {
                break;
            }
            std::thread::sleep(FRAME_DELAY);
        }
        Ok(None)
    }
}

/// Grab frames until a confident face is seen, keeping the best one.
///
/// Returns the frame together with its face, or `None` if no frame had one.
pub fn capture_best_face<S: FrameSource, P: FaceScanner>(
    source: &mut S,
    pipeline: &mut P,
    max_frames: u32,
    good_enough: f32,
) -> Result<Option<(RgbImage, FaceSample)>> {
    let mut best: Option<(RgbImage, FaceSample)> = None;

    for i in 0..max_frames {
        let frame = source.next_frame().context("capture frame")?;
        let img = DynamicImage::ImageRgb8(frame);

        match pipeline.best_face(&img) {
            Ok(Some(face)) => {
                let score = face.detection.score;
                info!("Frame {}: face detected with score {:.3}", i + 1, score);
                if best
                    .as_ref()
                    .map_or(true, |(_, b)| score > b.detection.score)
                {
                    best = Some((img.to_rgb8(), face));
                }
                if score > good_enough {
                    break;
                }
            }
            Ok(None) => warn!("Frame {}: no face detected", i + 1),
            Err(e) => warn!("Frame {}: {:#}", i + 1, e),
        }

        if !source.is_live() {
            break;
        }
        std::thread::sleep(FRAME_DELAY);
    }

    Ok(best)
}

/// Crop the detected face (with some margin) and encode it as a small PNG.
pub fn thumbnail_png(frame: &RgbImage, detection: &Detection) -> Result<Vec<u8>> {
    let img = DynamicImage::ImageRgb8(frame.clone());
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        anyhow::bail!("empty frame");
    }

    let [bx, by, bw, bh] = detection.bbox;
    let margin = 0.2 * bw.max(bh);
    let x0 = (bx - margin).max(0.0) as u32;
    let y0 = (by - margin).max(0.0) as u32;
    let x1 = ((bx + bw + margin).max(0.0) as u32).min(w);
    let y1 = ((by + bh + margin).max(0.0) as u32).min(h);

    let crop = if x1 > x0 && y1 > y0 {
        img.crop_imm(x0, y0, x1 - x0, y1 - y0)
    } else {
        img
    };

    let mut out = Cursor::new(Vec::new());
    crop.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE)
        .write_to(&mut out, ImageFormat::Png)
        .context("encoding thumbnail")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(descriptor: Vec<f32>) -> FaceSample {
        FaceSample {
            detection: Detection {
                bbox: [10.0, 10.0, 40.0, 40.0],
                score: 0.9,
                landmarks: [0.0; 10],
            },
            descriptor,
        }
    }

    fn record(id: &str, name: &str, descriptor: Vec<f32>) -> FaceRecord {
        FaceRecord {
            id: id.to_string(),
            name: name.to_string(),
            descriptor,
            created_at: 0,
            thumbnail: vec![],
        }
    }

    /// Replays one scripted result per frame.
    struct Scripted {
        frames: Vec<Result<Vec<FaceSample>>>,
        calls: usize,
    }

    impl Scripted {
        fn new(frames: Vec<Result<Vec<FaceSample>>>) -> Self {
            Self { frames, calls: 0 }
        }

        fn next(&mut self) -> Result<Vec<FaceSample>> {
            self.calls += 1;
            if self.frames.is_empty() {
                return Ok(vec![]);
            }
            self.frames.remove(0)
        }
    }

    impl FaceScanner for Scripted {
        fn best_face(&mut self, _img: &DynamicImage) -> Result<Option<FaceSample>> {
            Ok(self
                .next()?
                .into_iter()
                .max_by(|a, b| a.detection.score.total_cmp(&b.detection.score)))
        }

        fn all_faces(&mut self, _img: &DynamicImage) -> Result<Vec<FaceSample>> {
            self.next()
        }
    }

    /// A live source that never runs dry.
    struct Blank;

    impl FrameSource for Blank {
        fn next_frame(&mut self) -> Result<RgbImage> {
            Ok(RgbImage::new(8, 8))
        }
    }

    fn scored(descriptor: Vec<f32>, score: f32) -> FaceSample {
        let mut s = sample(descriptor);
        s.detection.score = score;
        s
    }

    #[test]
    fn run_stops_on_dimension_mismatch() {
        let known = vec![record("1", "Ada", vec![0.0; 4])];
        let scanner = Scripted::new(vec![
            Ok(vec![sample(vec![0.0; 3])]),
            Ok(vec![sample(vec![0.0; 4])]),
        ]);
        let mut session = RecognitionSession::new(scanner, known, 0.6);

        let err = session.run(&mut Blank, 5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchError>(),
            Some(MatchError::DimensionMismatch {
                expected: 3,
                found: 4,
                index: 0
            })
        ));
        assert_eq!(session.pipeline.calls, 1);
    }

    #[test]
    fn run_skips_frames_the_pipeline_fails_on() {
        let known = vec![record("1", "Ada", vec![0.0, 0.0])];
        let scanner = Scripted::new(vec![
            Err(anyhow::anyhow!("detector hiccup")),
            Ok(vec![sample(vec![0.0, 0.1])]),
        ]);
        let mut session = RecognitionSession::new(scanner, known, 0.6);

        let found = session.run(&mut Blank, 5).unwrap().expect("second frame matches");
        assert_eq!(found[0].result.id.as_deref(), Some("1"));
        assert_eq!(session.pipeline.calls, 2);
    }

    #[test]
    fn run_gives_up_after_max_frames() {
        let known = vec![record("1", "Ada", vec![0.0, 0.0])];
        let scanner = Scripted::new(vec![Ok(vec![sample(vec![5.0, 5.0])])]);
        let mut session = RecognitionSession::new(scanner, known, 0.6);

        let mut still = StillImage(RgbImage::new(8, 8));
        assert!(session.run(&mut still, 3).unwrap().is_none());
        assert_eq!(session.pipeline.calls, 1);
    }

    #[test]
    fn capture_keeps_best_face_and_stops_when_good_enough() {
        let mut scanner = Scripted::new(vec![
            Ok(vec![scored(vec![1.0], 0.5)]),
            Ok(vec![]),
            Ok(vec![scored(vec![2.0], 0.7), scored(vec![3.0], 0.65)]),
            Ok(vec![scored(vec![4.0], 0.9)]),
            Ok(vec![scored(vec![5.0], 0.95)]),
        ]);

        let (_, face) = capture_best_face(&mut Blank, &mut scanner, 10, 0.8)
            .unwrap()
            .expect("a face was seen");
        assert_eq!(face.descriptor, vec![4.0]);
        assert_eq!(scanner.calls, 4);
    }

    #[test]
    fn capture_without_faces_is_none() {
        let mut scanner = Scripted::new(vec![Err(anyhow::anyhow!("no model output"))]);
        let mut still = StillImage(RgbImage::new(8, 8));
        assert!(capture_best_face(&mut still, &mut scanner, 3, 0.8)
            .unwrap()
            .is_none());
    }

    #[test]
    fn every_face_gets_a_label() {
        let known = vec![record("1", "Ada", vec![0.0, 0.0]), record("2", "Bob", vec![1.0, 0.0])];
        let faces = vec![sample(vec![0.95, 0.0]), sample(vec![5.0, 5.0])];

        let labelled = label_faces(faces, &known, 0.6).unwrap();
        assert_eq!(labelled.len(), 2);
        assert_eq!(labelled[0].label(), "Bob (92%)");
        assert_eq!(labelled[1].label(), "Unknown");
    }

    #[test]
    fn mismatched_face_fails_the_frame() {
        let known = vec![record("1", "Ada", vec![0.0, 0.0])];
        let err = label_faces(vec![sample(vec![0.0; 3])], &known, 0.6).unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch { .. }));
    }

    #[test]
    fn still_image_is_not_live() {
        let mut src = StillImage(RgbImage::new(4, 4));
        assert!(!src.is_live());
        assert_eq!(src.next_frame().unwrap().dimensions(), (4, 4));
    }

    #[test]
    fn thumbnail_is_small_png() {
        let frame = RgbImage::from_pixel(640, 480, image::Rgb([200, 100, 50]));
        let det = Detection {
            bbox: [200.0, 120.0, 200.0, 240.0],
            score: 0.9,
            landmarks: [0.0; 10],
        };
        let png = thumbnail_png(&frame, &det).unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let decoded = image::load_from_memory(&png).unwrap();
        let (w, h) = decoded.dimensions();
        assert!(w <= THUMBNAIL_SIZE && h <= THUMBNAIL_SIZE);
        assert_eq!(h, THUMBNAIL_SIZE);
    }

    #[test]
    fn thumbnail_tolerates_boxes_outside_the_frame() {
        let frame = RgbImage::new(50, 50);
        let det = Detection {
            bbox: [-30.0, 40.0, 100.0, 100.0],
            score: 0.5,
            landmarks: [0.0; 10],
        };
        assert!(thumbnail_png(&frame, &det).is_ok());
    }
}
