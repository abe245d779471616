//! User-facing bloom parameters.

use std::ops::RangeInclusive;

use crate::backend::ImageId;

pub const INTENSITY_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const DIRT_INTENSITY_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const MIN_LUMINANCE_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const KNEE_STRENGTH_RANGE: RangeInclusive<f32> = 0.0..=4.0;

/// Snapshot of the bloom effect's parameters.
///
/// Hosts replace the whole record when the user edits the effect; a frame only
/// ever sees one snapshot. Values outside their declared ranges are accepted
/// here and clamped by [`BloomSettings::validated`] before use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomSettings {
    /// Overall bloom strength. Range \[0, 1\]. Default: 0.25.
    pub intensity: f32,
    /// Strength of the lens-dirt contribution. Range \[0, 1\]. Default: 0.5.
    pub dirt_intensity: f32,
    /// Host-owned dirt texture. Only a reference is held. Default: none.
    pub dirt_texture: Option<ImageId>,
    /// Luminance below which pixels do not contribute. Range \[0, 1\]. Default: 0.5.
    pub min_luminance: f32,
    /// Sharpness of the soft threshold curve around `min_luminance`. Range \[0, 4\]. Default: 1.0.
    pub knee_strength: f32,
    /// Replace the composited output with a view of the bloom buffer.
    pub debug_on: bool,
}

impl Default for BloomSettings {
    fn default() -> Self {
        Self {
            intensity: 0.25,
            dirt_intensity: 0.5,
            dirt_texture: None,
            min_luminance: 0.5,
            knee_strength: 1.0,
            debug_on: false,
        }
    }
}

impl BloomSettings {
    /// Copy of these settings with every numeric field forced into its range.
    ///
    /// Non-finite values fall back to the field's default.
    pub fn validated(self) -> Self {
        let defaults = Self::default();
        Self {
            intensity: clamp_or(self.intensity, INTENSITY_RANGE, defaults.intensity),
            dirt_intensity: clamp_or(
                self.dirt_intensity,
                DIRT_INTENSITY_RANGE,
                defaults.dirt_intensity,
            ),
            dirt_texture: self.dirt_texture,
            min_luminance: clamp_or(
                self.min_luminance,
                MIN_LUMINANCE_RANGE,
                defaults.min_luminance,
            ),
            knee_strength: clamp_or(
                self.knee_strength,
                KNEE_STRENGTH_RANGE,
                defaults.knee_strength,
            ),
            debug_on: self.debug_on,
        }
    }

    /// Whether the composite pass should read the dirt texture at all.
    pub fn has_dirt(&self) -> bool {
        self.dirt_texture.is_some() && self.validated().dirt_intensity > 0.0
    }
}

fn clamp_or(value: f32, range: RangeInclusive<f32>, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(*range.start(), *range.end())
    } else if value == f32::INFINITY {
        *range.end()
    } else if value == f32::NEG_INFINITY {
        *range.start()
    } else {
        fallback
    }
}
