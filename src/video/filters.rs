//! Ordered per-frame image transforms applied between decode and enqueue.

use bytes::Bytes;
use tracing::warn;

use crate::config::FrameFilterSpec;
use crate::video::frame::RawFrame;

#[derive(Debug, Clone)]
pub enum FrameFilter {
    /// Add `delta` to every channel, clamped to [0, 255]
    Brightness { delta: f32 },
    /// Multiply every channel by `alpha`, clamped
    Contrast { alpha: f32 },
    /// Luminance reduction to a single channel
    Greyscale,
    /// Bilinear scale by `scale`
    Resize { scale: f32 },
    /// Gaussian blur; `ksize` is forced odd
    Lowpass { ksize: usize },
}

impl FrameFilter {
    fn from_spec(spec: &FrameFilterSpec) -> Option<Self> {
        match spec.name.as_str() {
            "brightness" => Some(FrameFilter::Brightness { delta: spec.delta }),
            "contrast" => Some(FrameFilter::Contrast { alpha: spec.alpha }),
            "greyscale" => Some(FrameFilter::Greyscale),
            "resize" => Some(FrameFilter::Resize { scale: spec.scale }),
            "lowpass" => {
                let ksize = if spec.ksize % 2 == 1 { spec.ksize } else { spec.ksize + 1 };
                Some(FrameFilter::Lowpass { ksize })
            }
            _ => None,
        }
    }

    pub fn apply(&self, frame: &RawFrame) -> RawFrame {
        match self {
            FrameFilter::Brightness { delta } => map_pixels(frame, |v| v + delta),
            FrameFilter::Contrast { alpha } => map_pixels(frame, |v| v * alpha),
            FrameFilter::Greyscale => greyscale(frame),
            FrameFilter::Resize { scale } => resize_bilinear(frame, *scale),
            FrameFilter::Lowpass { ksize } => gaussian_blur(frame, *ksize),
        }
    }
}

/// Ordered filter pipeline built from a feed's config. Unknown filter names
/// are ignored.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    filters: Vec<FrameFilter>,
}

impl FilterPipeline {
    pub fn from_specs(specs: &[FrameFilterSpec]) -> Self {
        let mut filters = Vec::with_capacity(specs.len());
        for spec in specs {
            match FrameFilter::from_spec(spec) {
                Some(filter) => filters.push(filter),
                None => warn!(name = %spec.name, "Ignoring unknown frame filter"),
            }
        }
        FilterPipeline { filters }
    }

    pub fn apply(&self, mut frame: RawFrame) -> RawFrame {
        for filter in &self.filters {
            frame = filter.apply(&frame);
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

fn map_pixels(frame: &RawFrame, f: impl Fn(f32) -> f32) -> RawFrame {
    let data: Vec<u8> = frame
        .data
        .iter()
        .map(|&b| f(b as f32).clamp(0.0, 255.0) as u8)
        .collect();
    RawFrame {
        data: Bytes::from(data),
        width: frame.width,
        height: frame.height,
        channels: frame.channels,
    }
}

fn greyscale(frame: &RawFrame) -> RawFrame {
    if frame.channels == 1 {
        return frame.clone();
    }
    // Pixels arrive in BGR order
    let mut data = Vec::with_capacity(frame.width as usize * frame.height as usize);
    for px in frame.data.chunks_exact(frame.channels) {
        let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
        data.push((0.114 * b + 0.587 * g + 0.299 * r).clamp(0.0, 255.0) as u8);
    }
    RawFrame {
        data: Bytes::from(data),
        width: frame.width,
        height: frame.height,
        channels: 1,
    }
}

fn resize_bilinear(frame: &RawFrame, scale: f32) -> RawFrame {
    if scale <= 0.0 || (scale - 1.0).abs() < f32::EPSILON {
        return frame.clone();
    }
    let (w, h, c) = (frame.width as usize, frame.height as usize, frame.channels);
    let new_w = ((w as f32 * scale).round() as usize).max(1);
    let new_h = ((h as f32 * scale).round() as usize).max(1);

    let mut data = vec![0u8; new_w * new_h * c];
    let x_ratio = if new_w > 1 { (w - 1) as f32 / (new_w - 1) as f32 } else { 0.0 };
    let y_ratio = if new_h > 1 { (h - 1) as f32 / (new_h - 1) as f32 } else { 0.0 };

    for ny in 0..new_h {
        let sy = ny as f32 * y_ratio;
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let fy = sy - y0 as f32;

        for nx in 0..new_w {
            let sx = nx as f32 * x_ratio;
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let fx = sx - x0 as f32;

            for ch in 0..c {
                let p00 = frame.data[(y0 * w + x0) * c + ch] as f32;
                let p01 = frame.data[(y0 * w + x1) * c + ch] as f32;
                let p10 = frame.data[(y1 * w + x0) * c + ch] as f32;
                let p11 = frame.data[(y1 * w + x1) * c + ch] as f32;

                let top = p00 + (p01 - p00) * fx;
                let bottom = p10 + (p11 - p10) * fx;
                data[(ny * new_w + nx) * c + ch] = (top + (bottom - top) * fy).round() as u8;
            }
        }
    }

    RawFrame {
        data: Bytes::from(data),
        width: new_w as u32,
        height: new_h as u32,
        channels: c,
    }
}

fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    // Sigma derived from kernel size the same way OpenCV does for sigma=0
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (ksize / 2) as isize;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

fn gaussian_blur(frame: &RawFrame, ksize: usize) -> RawFrame {
    let ksize = if ksize % 2 == 1 { ksize } else { ksize + 1 };
    if ksize <= 1 {
        return frame.clone();
    }
    let kernel = gaussian_kernel(ksize);
    let half = (ksize / 2) as isize;
    let (w, h, c) = (frame.width as usize, frame.height as usize, frame.channels);

    // Separable convolution with edge clamping: horizontal, then vertical
    let mut horizontal = vec![0f32; w * h * c];
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let mut acc = 0f32;
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sx = (x as isize + ki as isize - half).clamp(0, w as isize - 1) as usize;
                    acc += kv * frame.data[(y * w + sx) * c + ch] as f32;
                }
                horizontal[(y * w + x) * c + ch] = acc;
            }
        }
    }

    let mut data = vec![0u8; w * h * c];
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let mut acc = 0f32;
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sy = (y as isize + ki as isize - half).clamp(0, h as isize - 1) as usize;
                    acc += kv * horizontal[(sy * w + x) * c + ch];
                }
                data[(y * w + x) * c + ch] = acc.clamp(0.0, 255.0) as u8;
            }
        }
    }

    RawFrame {
        data: Bytes::from(data),
        width: frame.width,
        height: frame.height,
        channels: c,
    }
}
