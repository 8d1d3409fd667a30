use anyhow::Result;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use crate::detect::Detection;

/// Reference eye positions for a 112x112 ArcFace-style crop.
const REF_LEFT_EYE: (f32, f32) = (38.2946, 51.6963);
const REF_RIGHT_EYE: (f32, f32) = (73.5318, 51.5014);
const REF_SIZE: f32 = 112.0;

/// 2D similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Transform taking the detected eyes onto the reference eyes of a
    /// `size x size` crop.
    pub fn from_eyes(left: (f32, f32), right: (f32, f32), size: u32) -> Result<Self> {
        let k = size as f32 / REF_SIZE;
        let dst_l = (REF_LEFT_EYE.0 * k, REF_LEFT_EYE.1 * k);
        let dst_r = (REF_RIGHT_EYE.0 * k, REF_RIGHT_EYE.1 * k);

        let src = (right.0 - left.0, right.1 - left.1);
        let dst = (dst_r.0 - dst_l.0, dst_r.1 - dst_l.1);
        let src_len2 = src.0 * src.0 + src.1 * src.1;
        if src_len2 <= f32::EPSILON {
            anyhow::bail!("degenerate landmarks: eyes coincide");
        }

        // complex division dst / src gives scale and rotation in one step
        let a = (dst.0 * src.0 + dst.1 * src.1) / src_len2;
        let b = (dst.1 * src.0 - dst.0 * src.1) / src_len2;

        Ok(Self {
            a,
            b,
            tx: dst_l.0 - (a * left.0 - b * left.1),
            ty: dst_l.1 - (b * left.0 + a * left.1),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Self {
        let det = self.a * self.a + self.b * self.b;
        let a = self.a / det;
        let b = -self.b / det;
        Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        }
    }
}

/// Warp the face in `detection` into an upright `size x size` crop.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<DynamicImage> {
    let lm = &detection.landmarks;
    let to_crop = Similarity::from_eyes((lm[0], lm[1]), (lm[2], lm[3]), size)?;
    let to_src = to_crop.inverse();

    let src = img.to_rgb8();
    let (w, h) = img.dimensions();
    let mut out = RgbImage::new(size, size);

    for y in 0..size {
        for x in 0..size {
            let (sx, sy) = to_src.apply((x as f32, y as f32));
            if let Some(px) = bilinear(&src, w, h, sx, sy) {
                out.put_pixel(x, y, px);
            }
        }
    }

    Ok(DynamicImage::ImageRgb8(out))
}

/// Sample `img` at a fractional position; `None` outside the image.
fn bilinear(img: &RgbImage, w: u32, h: u32, x: f32, y: f32) -> Option<Rgb<u8>> {
    if !(x >= 0.0 && y >= 0.0 && x < w as f32 && y < h as f32) {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p = [
        img.get_pixel(x0, y0),
        img.get_pixel(x1, y0),
        img.get_pixel(x0, y1),
        img.get_pixel(x1, y1),
    ];
    let wts = [
        (1.0 - fx) * (1.0 - fy),
        fx * (1.0 - fy),
        (1.0 - fx) * fy,
        fx * fy,
    ];

    let mut rgb = [0u8; 3];
    for (c, v) in rgb.iter_mut().enumerate() {
        let s: f32 = p.iter().zip(wts).map(|(px, wt)| px[c] as f32 * wt).sum();
        *v = s.round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgb(rgb))
}
