//! Gray-level reduction with optional dithering.
//!
//! E-ink panels show a small number of gray levels (2, 4 or 16). Rounding
//! every pixel to the nearest level bands gradients and screentones badly,
//! so the default is serpentine error diffusion.
//!
//! All functions work on one page at a time and keep no state between
//! calls.

use crate::config::DitherMode;
use image::GrayImage;

/// 8×8 Bayer threshold matrix, values 0–63.
const BAYER_8X8: [[u8; 8]; 8] = [
    [0, 32, 8, 40, 2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44, 4, 36, 14, 46, 6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [3, 35, 11, 43, 1, 33, 9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47, 7, 39, 13, 45, 5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// Error diffusion kernel: `(dx, dy, weight)` taps and the divisor.
struct Kernel {
    taps: &'static [(i32, i32, i16)],
    divisor: i16,
}

//     X   7
// 3   5   1
const FLOYD_STEINBERG: Kernel = Kernel {
    taps: &[(1, 0, 7), (-1, 1, 3), (0, 1, 5), (1, 1, 1)],
    divisor: 16,
};

//     X   1   1
// 1   1   1
//     1
const ATKINSON: Kernel = Kernel {
    taps: &[(1, 0, 1), (2, 0, 1), (-1, 1, 1), (0, 1, 1), (1, 1, 1), (0, 2, 1)],
    divisor: 8,
};

/// Reduce `image` in place to `levels` evenly spaced gray values.
///
/// `levels` of 256 or more leaves the image unchanged.
pub fn reduce(image: &mut GrayImage, levels: u16, mode: DitherMode) {
    if levels >= 256 {
        return;
    }
    let levels = levels.max(2);
    match mode {
        DitherMode::None => quantize_nearest(image, levels),
        DitherMode::Ordered => ordered(image, levels),
        DitherMode::FloydSteinberg => diffuse(image, levels, &FLOYD_STEINBERG),
        DitherMode::Atkinson => diffuse(image, levels, &ATKINSON),
    }
}

/// Value of the level closest to `value`.
#[inline]
fn closest_level(value: i16, levels: u16) -> u8 {
    let max = i32::from(levels) - 1;
    let v = i32::from(value).clamp(0, 255);
    let level = (v * max + 127) / 255;
    ((level * 255 + max / 2) / max) as u8
}

fn quantize_nearest(image: &mut GrayImage, levels: u16) {
    for p in image.pixels_mut() {
        p.0[0] = closest_level(i16::from(p.0[0]), levels);
    }
}

fn ordered(image: &mut GrayImage, levels: u16) {
    let step = 255 / (i32::from(levels) - 1);
    for (x, y, p) in image.enumerate_pixels_mut() {
        let threshold = i32::from(BAYER_8X8[(y % 8) as usize][(x % 8) as usize]);
        let offset = ((threshold * 2 + 1) * step) / 128 - step / 2;
        let v = (i32::from(p.0[0]) + offset).clamp(0, 255) as i16;
        p.0[0] = closest_level(v, levels);
    }
}

/// Serpentine error diffusion: even rows left to right, odd rows right to
/// left with the kernel mirrored, which avoids the diagonal "worm"
/// artefacts of one-directional scanning.
fn diffuse(image: &mut GrayImage, levels: u16, kernel: &Kernel) {
    let w = image.width() as usize;
    let h = image.height() as usize;
    if w == 0 || h == 0 {
        return;
    }

    // i16 working buffer to hold negative error values
    let mut buffer: Vec<i16> = image.as_raw().iter().map(|&v| i16::from(v)).collect();

    for y in 0..h {
        let going_right = y % 2 == 0;
        for step in 0..w {
            let x = if going_right { step } else { w - 1 - step };
            let idx = y * w + x;
            let old = buffer[idx].clamp(0, 255);
            let new = i16::from(closest_level(old, levels));
            let error = old - new;
            buffer[idx] = new;

            for &(dx, dy, weight) in kernel.taps {
                let dx = if going_right { dx } else { -dx };
                let nx = x as i32 + dx;
                let ny = y + dy as usize;
                if nx < 0 || nx >= w as i32 || ny >= h {
                    continue;
                }
                let n = ny * w + nx as usize;
                buffer[n] = buffer[n].saturating_add(error * weight / kernel.divisor);
            }
        }
    }

    for (dst, &v) in image.iter_mut().zip(buffer.iter()) {
        *dst = v.clamp(0, 255) as u8;
    }
}
