//! Built-in device profiles.
//!
//! A profile is only a starting point for a [`TransformConfig`]: target
//! screen size, gray depth and colour mode. Everything else keeps its
//! default and can be overridden afterwards.

use crate::config::{ColorMode, TransformConfig};
use crate::error::ConvertError;
use serde::Serialize;

/// A named e-reader preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u8,
    pub color: ColorMode,
}

impl DeviceProfile {
    /// Default transform settings for this device.
    pub fn transform_config(&self) -> TransformConfig {
        TransformConfig {
            width: self.width,
            height: self.height,
            bits_per_pixel: self.bits_per_pixel,
            color: self.color,
            ..TransformConfig::default()
        }
    }
}

const fn gray(name: &'static str, description: &'static str, width: u32, height: u32) -> DeviceProfile {
    DeviceProfile {
        name,
        description,
        width,
        height,
        bits_per_pixel: 4,
        color: ColorMode::Grayscale,
    }
}

static PROFILES: &[DeviceProfile] = &[
    gray("kindle-paperwhite", "Kindle Paperwhite 3/4, 6\" 300 ppi", 1072, 1448),
    gray("kindle-oasis", "Kindle Oasis 2/3, 7\" 300 ppi", 1264, 1680),
    gray("kobo-clara", "Kobo Clara HD/2E, 6\" 300 ppi", 1072, 1448),
    gray("kobo-libra", "Kobo Libra 2, 7\" 300 ppi", 1264, 1680),
    gray("kobo-elipsa", "Kobo Elipsa, 10.3\" 227 ppi", 1404, 1872),
    gray("remarkable-2", "reMarkable 2, 10.3\" 226 ppi", 1404, 1872),
    gray("generic-6in", "Older 6\" readers, 167 ppi", 600, 800),
    DeviceProfile {
        name: "color-kaleido",
        description: "Kaleido 3 colour panels, 7\" (colour layer 150 ppi)",
        width: 1264,
        height: 1680,
        bits_per_pixel: 8,
        color: ColorMode::Color,
    },
];

/// All built-in profiles, in display order.
pub fn list() -> &'static [DeviceProfile] {
    PROFILES
}

/// Look up a profile by name (case-insensitive).
pub fn resolve(name: &str) -> Result<&'static DeviceProfile, ConvertError> {
    PROFILES
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| ConvertError::UnknownProfile {
            name: name.to_string(),
        })
}
