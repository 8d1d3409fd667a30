//! Camera capture.
//!
//! A [`Camera`] owns the capture stream for as long as it lives. Dropping it
//! stops streaming and closes the device, so every exit path out of a capture
//! loop releases the camera.

use anyhow::{Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

/// Pixel layouts the camera may hand us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb3,
    Yuyv,
    Grey,
    Other(FourCC),
}

impl From<FourCC> for PixelFormat {
    fn from(f: FourCC) -> Self {
        match &f.repr {
            b"RGB3" => Self::Rgb3,
            b"YUYV" => Self::Yuyv,
            b"GREY" => Self::Grey,
            _ => Self::Other(f),
        }
    }
}

pub struct Camera {
    device: String,
    stream: Stream<'static>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Camera {
    /// Acquire `device`, preferring RGB3, then YUYV, else whatever it reports.
    pub fn open(device: &str) -> Result<Self> {
        let dev = Device::with_path(device).with_context(|| format!("open camera {}", device))?;
        let mut fmt = dev.format().context("get format")?;
        for code in [b"RGB3", b"YUYV"] {
            if fmt.fourcc == FourCC::new(code) {
                break;
            }
            let wanted = Format::new(fmt.width, fmt.height, FourCC::new(code));
            fmt = dev.set_format(&wanted).unwrap_or(fmt);
        }

        let stream = Stream::with_buffers(&dev, Type::VideoCapture, 4).context("stream")?;
        log::info!(
            "camera {} acquired: {}x{} {}",
            device,
            fmt.width,
            fmt.height,
            fmt.fourcc
        );

        Ok(Self {
            device: device.to_string(),
            stream,
            width: fmt.width,
            height: fmt.height,
            format: fmt.fourcc.into(),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame(&mut self) -> Result<RgbImage> {
        let (data, meta) = self.stream.next().context("capture frame")?;
        log::debug!(
            "captured frame: {}x{} {:?} seq={} len={}",
            self.width,
            self.height,
            self.format,
            meta.sequence,
            data.len()
        );
        to_rgb(self.format, self.width, self.height, data)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        log::info!("camera {} released", self.device);
    }
}

/// Convert one raw frame to an RGB image.
pub fn to_rgb(format: PixelFormat, width: u32, height: u32, data: &[u8]) -> Result<RgbImage> {
    let buf = match format {
        PixelFormat::Rgb3 => data.to_vec(),
        PixelFormat::Yuyv => yuyv_to_rgb(width, height, data)?,
        PixelFormat::Grey => grey_to_rgb(width, height, data)?,
        PixelFormat::Other(f) => {
            log::warn!("unexpected pixel format {}, passing through raw", f);
            data.to_vec()
        }
    };

    let expected = (width * height * 3) as usize;
    if buf.len() < expected {
        anyhow::bail!(
            "buffer too small: got {}, expected {} ({:?})",
            buf.len(),
            expected,
            format
        );
    }
    let mut buf = buf;
    buf.truncate(expected);

    ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buf)
        .ok_or_else(|| anyhow::anyhow!("failed to build image buffer"))
}

fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected {
        anyhow::bail!("short YUYV buffer");
    }
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp(y + 1.402 * v));
            out.push(clamp(y - 0.344136 * u - 0.714136 * v));
            out.push(clamp(y + 1.772 * u));
        }
    }
    Ok(out)
}

fn clamp(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

fn grey_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let expected = (width * height) as usize;
    if data.len() < expected {
        anyhow::bail!("short GREY buffer");
    }
    Ok(data[..expected].iter().flat_map(|&y| [y, y, y]).collect())
}
