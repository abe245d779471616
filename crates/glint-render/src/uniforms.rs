//! Passes and uniform slots of the bloom shading program.

use bytemuck::{Pod, Zeroable};

use crate::backend::ImageId;
use crate::settings::BloomSettings;

/// The passes of the bloom shading program, in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BloomPass {
    /// Luminance threshold with a soft knee; reads the source image.
    Extract = 0,
    /// Halve resolution with a fixed 4-tap filter.
    Downsample = 1,
    /// Add a coarser level, scaled by the blend weight, onto a finer one.
    Upsample = 2,
    /// Add bloom (and dirt) onto the destination.
    Composite = 3,
    /// Overwrite the destination with the bloom buffer.
    Debug = 4,
}

impl BloomPass {
    pub const ALL: [BloomPass; 5] = [
        BloomPass::Extract,
        BloomPass::Downsample,
        BloomPass::Upsample,
        BloomPass::Composite,
        BloomPass::Debug,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Fragment entry point implementing this pass.
    pub fn entry_point(self) -> &'static str {
        match self {
            BloomPass::Extract => "fs_extract",
            BloomPass::Downsample => "fs_downsample",
            BloomPass::Upsample => "fs_upsample",
            BloomPass::Composite => "fs_composite",
            BloomPass::Debug => "fs_debug",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BloomPass::Extract => "bloom-extract",
            BloomPass::Downsample => "bloom-downsample",
            BloomPass::Upsample => "bloom-upsample",
            BloomPass::Composite => "bloom-composite",
            BloomPass::Debug => "bloom-debug",
        }
    }

    /// Whether the pass adds onto the destination's current contents.
    pub fn is_additive(self) -> bool {
        matches!(self, BloomPass::Upsample | BloomPass::Composite)
    }
}

/// Every input the bloom shading program consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformSlot {
    MinLuminance,
    KneeStrength,
    Intensity,
    DirtTexture,
    DirtIntensity,
    MipLevel,
    BlendWeight,
    BlurDirection,
}

impl UniformSlot {
    pub const ALL: [UniformSlot; 8] = [
        UniformSlot::MinLuminance,
        UniformSlot::KneeStrength,
        UniformSlot::Intensity,
        UniformSlot::DirtTexture,
        UniformSlot::DirtIntensity,
        UniformSlot::MipLevel,
        UniformSlot::BlendWeight,
        UniformSlot::BlurDirection,
    ];

    /// Name of the slot in the shading program.
    pub fn name(self) -> &'static str {
        match self {
            UniformSlot::MinLuminance => "min_luminance",
            UniformSlot::KneeStrength => "knee_strength",
            UniformSlot::Intensity => "intensity",
            UniformSlot::DirtTexture => "dirt_texture",
            UniformSlot::DirtIntensity => "dirt_intensity",
            UniformSlot::MipLevel => "mip_level",
            UniformSlot::BlendWeight => "blend_weight",
            UniformSlot::BlurDirection => "blur_direction",
        }
    }

    /// Texture slots are bound, not packed into [`BloomUniforms`].
    pub fn is_texture(self) -> bool {
        matches!(self, UniformSlot::DirtTexture)
    }
}

/// A value written into a [`UniformSlot`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Texture(Option<ImageId>),
}

/// GPU uniform block for the bloom shading program.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BloomUniforms {
    pub min_luminance: f32,
    pub knee_strength: f32,
    pub intensity: f32,
    pub dirt_intensity: f32,
    pub mip_level: f32,
    pub blend_weight: f32,
    pub blur_direction: [f32; 2],
}

/// Uniform values plus bound textures for one pass.
///
/// Slots may be written in any order. The dirt intensity is kept as written
/// and only reads as zero through [`MaterialState::uniforms`] while no dirt
/// texture is bound.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MaterialState {
    values: BloomUniforms,
    dirt_texture: Option<ImageId>,
}

impl MaterialState {
    /// Material built from settings, clamped first.
    pub fn from_settings(settings: &BloomSettings) -> Self {
        let settings = settings.validated();
        let mut material = Self::default();
        material.set(
            UniformSlot::MinLuminance,
            UniformValue::Float(settings.min_luminance),
        );
        material.set(
            UniformSlot::KneeStrength,
            UniformValue::Float(settings.knee_strength),
        );
        material.set(UniformSlot::Intensity, UniformValue::Float(settings.intensity));
        material.set(
            UniformSlot::DirtTexture,
            UniformValue::Texture(settings.dirt_texture),
        );
        material.set(
            UniformSlot::DirtIntensity,
            UniformValue::Float(settings.dirt_intensity),
        );
        material
    }

    /// Write one slot. A value of the wrong kind for the slot is ignored.
    pub fn set(&mut self, slot: UniformSlot, value: UniformValue) {
        let u = &mut self.values;
        match (slot, value) {
            (UniformSlot::MinLuminance, UniformValue::Float(v)) => u.min_luminance = v,
            (UniformSlot::KneeStrength, UniformValue::Float(v)) => u.knee_strength = v,
            (UniformSlot::Intensity, UniformValue::Float(v)) => u.intensity = v,
            (UniformSlot::DirtIntensity, UniformValue::Float(v)) => u.dirt_intensity = v,
            (UniformSlot::MipLevel, UniformValue::Float(v)) => u.mip_level = v,
            (UniformSlot::BlendWeight, UniformValue::Float(v)) => u.blend_weight = v,
            (UniformSlot::BlurDirection, UniformValue::Vec2(v)) => u.blur_direction = v,
            (UniformSlot::DirtTexture, UniformValue::Texture(t)) => self.dirt_texture = t,
            (slot, value) => {
                log::warn!("Ignoring {value:?} written to uniform slot '{}'", slot.name());
            }
        }
    }

    /// The uniform block as the shading program sees it.
    pub fn uniforms(&self) -> BloomUniforms {
        let mut block = self.values;
        if self.dirt_texture.is_none() {
            block.dirt_intensity = 0.0;
        }
        block
    }

    /// Bound dirt texture, whether or not it contributes.
    pub fn dirt_texture(&self) -> Option<ImageId> {
        self.dirt_texture
    }

    /// Dirt texture to sample, if the dirt contribution is non-zero.
    pub fn active_dirt(&self) -> Option<ImageId> {
        self.dirt_texture
            .filter(|_| self.values.dirt_intensity > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_block_size() {
        assert_eq!(std::mem::size_of::<BloomUniforms>(), 32);
    }

    #[test]
    fn test_pass_indices_are_program_order() {
        for (i, pass) in BloomPass::ALL.iter().enumerate() {
            assert_eq!(pass.index(), i);
        }
    }

    #[test]
    fn test_only_upsample_and_composite_are_additive() {
        let additive: Vec<_> = BloomPass::ALL
            .into_iter()
            .filter(|p| p.is_additive())
            .collect();
        assert_eq!(additive, vec![BloomPass::Upsample, BloomPass::Composite]);
    }

    #[test]
    fn test_material_from_default_settings() {
        let material = MaterialState::from_settings(&BloomSettings::default());
        assert_eq!(material.uniforms().min_luminance, 0.5);
        assert_eq!(material.uniforms().knee_strength, 1.0);
        assert_eq!(material.uniforms().intensity, 0.25);
        assert_eq!(material.dirt_texture(), None);
        // No dirt texture: dirt contribution forced to zero.
        assert_eq!(material.uniforms().dirt_intensity, 0.0);
        assert_eq!(material.active_dirt(), None);
    }

    #[test]
    fn test_material_with_dirt_texture() {
        let settings = BloomSettings {
            dirt_texture: Some(ImageId(3)),
            dirt_intensity: 0.8,
            ..Default::default()
        };
        let material = MaterialState::from_settings(&settings);
        assert_eq!(material.uniforms().dirt_intensity, 0.8);
        assert_eq!(material.active_dirt(), Some(ImageId(3)));
    }

    #[test]
    fn test_dirt_slots_are_order_independent() {
        let mut intensity_first = MaterialState::default();
        intensity_first.set(UniformSlot::DirtIntensity, UniformValue::Float(0.8));
        assert_eq!(intensity_first.uniforms().dirt_intensity, 0.0);
        assert_eq!(intensity_first.active_dirt(), None);
        intensity_first.set(UniformSlot::DirtTexture, UniformValue::Texture(Some(ImageId(3))));

        let mut texture_first = MaterialState::default();
        texture_first.set(UniformSlot::DirtTexture, UniformValue::Texture(Some(ImageId(3))));
        texture_first.set(UniformSlot::DirtIntensity, UniformValue::Float(0.8));

        for material in [intensity_first, texture_first] {
            assert_eq!(material.uniforms().dirt_intensity, 0.8);
            assert_eq!(material.active_dirt(), Some(ImageId(3)));
        }
        assert_eq!(intensity_first, texture_first);
    }

    #[test]
    fn test_unbinding_dirt_keeps_requested_intensity() {
        let mut material = MaterialState::default();
        material.set(UniformSlot::DirtTexture, UniformValue::Texture(Some(ImageId(1))));
        material.set(UniformSlot::DirtIntensity, UniformValue::Float(0.4));
        material.set(UniformSlot::DirtTexture, UniformValue::Texture(None));
        assert_eq!(material.uniforms().dirt_intensity, 0.0);
        assert_eq!(material.active_dirt(), None);

        material.set(UniformSlot::DirtTexture, UniformValue::Texture(Some(ImageId(2))));
        assert_eq!(material.uniforms().dirt_intensity, 0.4);
        assert_eq!(material.active_dirt(), Some(ImageId(2)));
    }

    #[test]
    fn test_material_clamps_settings() {
        let settings = BloomSettings {
            intensity: 7.0,
            knee_strength: -2.0,
            ..Default::default()
        };
        let material = MaterialState::from_settings(&settings);
        assert_eq!(material.uniforms().intensity, 1.0);
        assert_eq!(material.uniforms().knee_strength, 0.0);
    }

    #[test]
    fn test_mismatched_value_is_ignored() {
        let mut material = MaterialState::default();
        material.set(UniformSlot::BlendWeight, UniformValue::Vec2([1.0, 2.0]));
        assert_eq!(material.uniforms().blend_weight, 0.0);
        material.set(UniformSlot::BlendWeight, UniformValue::Float(0.5));
        assert_eq!(material.uniforms().blend_weight, 0.5);
    }

    #[test]
    fn test_slot_names_are_unique() {
        let mut names: Vec<_> = UniformSlot::ALL.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), UniformSlot::ALL.len());
    }
}
