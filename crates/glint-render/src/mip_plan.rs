//! Pyramid depth and per-level sizes for one bloom frame.
//!
//! The depth grows with the logarithm of the source's largest dimension so the
//! bloom radius tracks resolution, but it is bounded on both sides: at least one
//! upsample step always exists and the number of passes never exceeds a fixed
//! budget. The unrounded depth is kept as well; it drives the blend weight of the
//! coarsest level so the radius changes continuously during a resize.

use crate::error::BloomError;

/// Lowest pyramid level the upsample phase collapses into. Its buffer is the final bloom image.
pub const MIN_UPSAMPLE_LEVEL: u32 = 1;

/// Deepest pyramid level ever built.
pub const MAX_MIP_LEVEL: u32 = 7;

/// Source dimension (in pixels) that corresponds to one octave of pyramid depth.
const BASE_SIZE: f32 = 32.0;

/// Width and height of an image in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The larger of the two axes.
    pub fn max_dimension(self) -> u32 {
        self.width.max(self.height)
    }

    /// Next pyramid level: each axis floor-divided by two, never below one texel.
    pub fn halved(self) -> Self {
        Self {
            width: (self.width / 2).max(1),
            height: (self.height / 2).max(1),
        }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn texel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Continuous pyramid depth for a source whose largest dimension is `max_dim`.
///
/// `clamp(log2(max_dim / 32 + 1), MIN_UPSAMPLE_LEVEL, MAX_MIP_LEVEL)`
pub fn mip_level_float(max_dim: u32) -> f32 {
    (max_dim as f32 / BASE_SIZE + 1.0)
        .log2()
        .clamp(MIN_UPSAMPLE_LEVEL as f32, MAX_MIP_LEVEL as f32)
}

/// Derived per-frame layout of the bloom pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct MipPlan {
    mip_level: u32,
    mip_level_float: f32,
    levels: Vec<Extent>,
}

impl MipPlan {
    /// Plan the pyramid for a source of the given size.
    ///
    /// Fails with [`BloomError::InvalidFrameDimensions`] when either axis is zero.
    pub fn for_source(source: Extent) -> Result<Self, BloomError> {
        if source.is_empty() {
            return Err(BloomError::InvalidFrameDimensions {
                width: source.width,
                height: source.height,
            });
        }

        let mip_level_float = mip_level_float(source.max_dimension());
        let mip_level = mip_level_float as u32;

        let mut levels = Vec::with_capacity(mip_level as usize + 1);
        let mut size = source;
        for _ in 0..=mip_level {
            levels.push(size);
            size = size.halved();
        }

        Ok(Self {
            mip_level,
            mip_level_float,
            levels,
        })
    }

    /// Index of the coarsest level (M). The pyramid holds `M + 1` levels.
    pub fn mip_level(&self) -> u32 {
        self.mip_level
    }

    /// Unrounded pyramid depth, written to the shading program's `MipLevel` slot.
    pub fn mip_level_float(&self) -> f32 {
        self.mip_level_float
    }

    /// Extent of every level, finest first.
    pub fn levels(&self) -> &[Extent] {
        &self.levels
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Weight applied when level `level` is blended into level `level - 1`.
    pub fn blend_weight(&self, level: u32) -> f32 {
        (self.mip_level_float - level as f32).clamp(0.0, 1.0)
    }

    /// Levels visited by the upsample phase, coarsest first: `M, M-1, ..., MIN_UPSAMPLE_LEVEL + 1`.
    pub fn upsample_levels(&self) -> impl Iterator<Item = u32> + use<> {
        (MIN_UPSAMPLE_LEVEL + 1..=self.mip_level).rev()
    }
}
