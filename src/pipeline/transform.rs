//! Transform stage: decoded page → one or two device-ready pages.
//!
//! Per page, in order:
//!
//! 1. **Split** landscape spreads into two halves when enabled. The halves
//!    keep the source index and get sub-keys `a`/`b`, ordered by reading
//!    direction.
//! 2. **Colour reduction**: grayscale pages become 8-bit luma; colour
//!    pages become RGB8.
//! 3. **Resize** into the target box, aspect ratio preserved.
//! 4. **Autocontrast**: stretch the histogram between the `cutoff` and
//!    `100 - cutoff` percentiles (grayscale only).
//! 5. **Gamma** through a 256-entry lookup table.
//! 6. **Fit**: pad or centre-crop to exactly the box size.
//! 7. **Quantize** to `2^bits` gray levels with the configured dither
//!    (grayscale only).
//!
//! Everything here is a pure function of the input pixels and the
//! [`TransformConfig`]; no state survives between pages, so any number of
//! workers can share one [`TransformStage`].

use crate::config::{ColorMode, Fit, SplitPolicy, TransformConfig};
use crate::page::{PageIndex, PageKey};
use crate::pipeline::dither;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Pixel, Rgb};
use tracing::trace;

/// Precomputed per-job transform state.
#[derive(Debug, Clone)]
pub struct TransformStage {
    config: TransformConfig,
    gamma_lut: Option<[u8; 256]>,
}

impl TransformStage {
    pub fn new(config: &TransformConfig) -> Self {
        // gamma == 1 leaves every value in place
        let gamma_lut = ((config.gamma - 1.0).abs() > 0.001).then(|| gamma_lut(config.gamma));
        Self {
            config: config.clone(),
            gamma_lut,
        }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Run the full pipeline on one decoded page.
    ///
    /// Returns one page, or two for a split spread, in reading order.
    pub fn apply(&self, image: DynamicImage, index: PageIndex) -> Vec<(PageKey, DynamicImage)> {
        match self.split(image) {
            Split::Whole(image) => vec![(PageKey::whole(index), self.render(image))],
            Split::Halves(first, second) => vec![
                (PageKey::split(index, 0, 2), self.render(first)),
                (PageKey::split(index, 1, 2), self.render(second)),
            ],
        }
    }

    fn split(&self, image: DynamicImage) -> Split {
        let (w, h) = (image.width(), image.height());
        if self.config.split == SplitPolicy::Off || w <= h || w < 2 {
            return Split::Whole(image);
        }
        let half = w / 2;
        let left = image.crop_imm(0, 0, half, h);
        let right = image.crop_imm(half, 0, w - half, h);
        trace!("Splitting {w}x{h} spread at x={half}");
        match self.config.split {
            SplitPolicy::RightToLeft => Split::Halves(right, left),
            _ => Split::Halves(left, right),
        }
    }

    fn render(&self, image: DynamicImage) -> DynamicImage {
        match self.config.color {
            ColorMode::Grayscale => DynamicImage::ImageLuma8(self.render_gray(image.into_luma8())),
            ColorMode::Color => {
                let mut rgb = self.resize(image.into_rgb8());
                if let Some(lut) = &self.gamma_lut {
                    for v in rgb.iter_mut() {
                        *v = lut[*v as usize];
                    }
                }
                DynamicImage::ImageRgb8(self.fit_box(rgb, Rgb([255, 255, 255])))
            }
        }
    }

    fn render_gray(&self, gray: GrayImage) -> GrayImage {
        let mut gray = self.resize(gray);
        autocontrast(&mut gray, self.config.autocontrast_cutoff);
        if let Some(lut) = &self.gamma_lut {
            for v in gray.iter_mut() {
                *v = lut[*v as usize];
            }
        }
        let mut gray = self.fit_box(gray, Luma([255]));
        dither::reduce(&mut gray, self.config.levels(), self.config.dither);
        gray
    }

    fn resize<P>(&self, image: ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let (w, h) = image.dimensions();
        let (bw, bh) = (self.config.width, self.config.height);
        let (nw, nh) = match self.config.fit {
            Fit::Contain | Fit::Pad => resize_dimensions(w, h, bw, bh),
            Fit::Crop => cover_dimensions(w, h, bw, bh),
        };
        // Same width means same height; growing is opt-in.
        if nw == w || (nw > w && !self.config.upscale) {
            return image;
        }
        trace!("Resizing {w}x{h} → {nw}x{nh}");
        imageops::resize(&image, nw, nh, FilterType::from(self.config.filter))
    }

    /// Centre the page on a `width × height` canvas, cropping or padding
    /// as needed. No-op for [`Fit::Contain`].
    fn fit_box<P>(&self, image: ImageBuffer<P, Vec<u8>>, background: P) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8>,
    {
        let (bw, bh) = (self.config.width, self.config.height);
        if self.config.fit == Fit::Contain || image.dimensions() == (bw, bh) {
            return image;
        }
        let (w, h) = image.dimensions();
        let x = (i64::from(bw) - i64::from(w)) / 2;
        let y = (i64::from(bh) - i64::from(h)) / 2;
        let mut canvas = ImageBuffer::from_pixel(bw, bh, background);
        imageops::replace(&mut canvas, &image, x, y);
        canvas
    }
}

enum Split {
    Whole(DynamicImage),
    Halves(DynamicImage, DynamicImage),
}

/// Dimensions that fit `x × y` inside `nx × ny` with the aspect ratio kept.
///
/// A zero target dimension means "unconstrained" and takes the source
/// value, so `0 × 50` scales to a height of 50.
pub fn resize_dimensions(x: u32, y: u32, nx: u32, ny: u32) -> (u32, u32) {
    let nx = if nx > 0 { nx } else { x };
    let ny = if ny > 0 { ny } else { y };
    if x == 0 || y == 0 {
        return (x, y);
    }

    let width_limited = u64::from(nx) * u64::from(y) <= u64::from(x) * u64::from(ny);
    if width_limited {
        let h = (u64::from(y) * u64::from(nx) / u64::from(x)).max(1);
        (nx, h as u32)
    } else {
        let w = (u64::from(x) * u64::from(ny) / u64::from(y)).max(1);
        (w as u32, ny)
    }
}

/// Smallest dimensions with the aspect ratio of `x × y` that cover
/// `nx × ny`.
fn cover_dimensions(x: u32, y: u32, nx: u32, ny: u32) -> (u32, u32) {
    if x == 0 || y == 0 || nx == 0 || ny == 0 {
        return resize_dimensions(x, y, nx, ny);
    }
    if u64::from(nx) * u64::from(y) >= u64::from(ny) * u64::from(x) {
        let h = (u64::from(y) * u64::from(nx)).div_ceil(u64::from(x));
        (nx, h as u32)
    } else {
        let w = (u64::from(x) * u64::from(ny)).div_ceil(u64::from(y));
        (w as u32, ny)
    }
}

fn gamma_lut(gamma: f64) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        let x = (i as f64 / 255.0).powf(1.0 / gamma) * 255.0;
        // truncate, matching integer pixel semantics
        *v = x.clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Smallest level whose cumulative share of pixels reaches `percent`.
fn percentile(histogram: &[u64; 256], total: u64, percent: u8) -> u8 {
    let mut cumulative = 0u64;
    for (level, &count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative * 100 / total >= u64::from(percent) {
            return level as u8;
        }
    }
    255
}

/// Stretch the histogram so the `cutoff`th and `100 - cutoff`th
/// percentiles land on 0 and 255.
fn autocontrast(image: &mut GrayImage, cutoff: u8) {
    let mut histogram = [0u64; 256];
    for &v in image.iter() {
        histogram[v as usize] += 1;
    }
    let total = image.len() as u64;
    if total == 0 {
        return;
    }

    let lower = percentile(&histogram, total, cutoff);
    let upper = percentile(&histogram, total, 100 - cutoff);
    if upper <= lower || (lower == 0 && upper == 255) {
        return;
    }

    let span = u32::from(upper - lower);
    for v in image.iter_mut() {
        *v = if *v <= lower {
            0
        } else if *v >= upper {
            255
        } else {
            (u32::from(*v - lower) * 255 / span) as u8
        };
    }
}
