//! The bloom shading program: WGSL source plus the passes and uniform slots it exposes.

use crate::uniforms::{BloomPass, UniformSlot};

/// Everything a backend needs to bind the bloom program.
///
/// The pass and slot lists are the complete interface between the pyramid and
/// the program; a backend builds one pipeline per listed pass and packs the
/// listed numeric slots into [`BloomUniforms`](crate::BloomUniforms).
#[derive(Debug, Clone, Copy)]
pub struct ShadingProgram {
    pub label: &'static str,
    pub source: &'static str,
    pub passes: &'static [BloomPass],
    pub uniforms: &'static [UniformSlot],
    /// Fragment entry point used for passthrough copies.
    pub copy_entry_point: &'static str,
    /// Shared fullscreen vertex entry point.
    pub vertex_entry_point: &'static str,
}

impl ShadingProgram {
    pub fn supports(&self, pass: BloomPass) -> bool {
        self.passes.contains(&pass)
    }

    /// Slots packed into the uniform block (texture slots are bound separately).
    pub fn numeric_slots(&self) -> impl Iterator<Item = UniformSlot> + '_ {
        self.uniforms.iter().copied().filter(|s| !s.is_texture())
    }
}

/// The stock bloom program.
pub const BLOOM_PROGRAM: ShadingProgram = ShadingProgram {
    label: "bloom-shader",
    source: BLOOM_SHADER_SOURCE,
    passes: &BloomPass::ALL,
    uniforms: &UniformSlot::ALL,
    copy_entry_point: "fs_copy",
    vertex_entry_point: "vs_fullscreen",
};

/// WGSL source for all bloom passes (extract, downsample, upsample, composite, debug, copy).
pub const BLOOM_SHADER_SOURCE: &str = r#"
struct BloomUniforms {
    min_luminance: f32,
    knee_strength: f32,
    intensity: f32,
    dirt_intensity: f32,
    mip_level: f32,
    blend_weight: f32,
    blur_direction: vec2<f32>,
};

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@group(0) @binding(0) var<uniform> params: BloomUniforms;
@group(1) @binding(0) var input_tex: texture_2d<f32>;
@group(1) @binding(1) var input_sampler: sampler;
@group(2) @binding(0) var dirt_tex: texture_2d<f32>;
@group(2) @binding(1) var dirt_sampler: sampler;

@vertex
fn vs_fullscreen(@builtin(vertex_index) idx: u32) -> VertexOutput {
    let uv = vec2<f32>(f32((idx << 1u) & 2u), f32(idx & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(uv.x, 1.0 - uv.y);
    return out;
}

fn luminance(color: vec3<f32>) -> f32 {
    return dot(color, vec3<f32>(0.2126, 0.7152, 0.0722));
}

fn soft_threshold(color: vec3<f32>, threshold: f32, knee_strength: f32) -> vec3<f32> {
    let lum = luminance(color);
    let knee = threshold * knee_strength * 0.5 + 0.0001;
    let soft = clamp(lum - threshold + knee, 0.0, 2.0 * knee);
    let curve = soft * soft / (4.0 * knee);
    let factor = max(lum - threshold, curve) / max(lum, 0.0001);
    return color * max(factor, 0.0);
}

fn four_tap(uv: vec2<f32>, offset: vec2<f32>) -> vec3<f32> {
    let a = textureSample(input_tex, input_sampler, uv + vec2(-offset.x, -offset.y)).rgb;
    let b = textureSample(input_tex, input_sampler, uv + vec2( offset.x, -offset.y)).rgb;
    let c = textureSample(input_tex, input_sampler, uv + vec2(-offset.x,  offset.y)).rgb;
    let d = textureSample(input_tex, input_sampler, uv + vec2( offset.x,  offset.y)).rgb;
    return (a + b + c + d) * 0.25;
}

@fragment
fn fs_extract(in: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSample(input_tex, input_sampler, in.uv).rgb;
    let extracted = soft_threshold(color, params.min_luminance, params.knee_strength);
    return vec4<f32>(extracted, 1.0);
}

@fragment
fn fs_downsample(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = 1.0 / vec2<f32>(textureDimensions(input_tex));
    return vec4<f32>(four_tap(in.uv, texel), 1.0);
}

@fragment
fn fs_upsample(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = 0.5 / vec2<f32>(textureDimensions(input_tex));
    return vec4<f32>(four_tap(in.uv, texel) * params.blend_weight, 0.0);
}

@fragment
fn fs_composite(in: VertexOutput) -> @location(0) vec4<f32> {
    let bloom = textureSample(input_tex, input_sampler, in.uv).rgb;
    var result = bloom * params.intensity;
    if params.dirt_intensity > 0.0 {
        let dirt = textureSample(dirt_tex, dirt_sampler, in.uv).rgb;
        result += bloom * dirt * params.dirt_intensity;
    }
    return vec4<f32>(result, 0.0);
}

@fragment
fn fs_debug(in: VertexOutput) -> @location(0) vec4<f32> {
    let bloom = textureSample(input_tex, input_sampler, in.uv).rgb;
    return vec4<f32>(bloom, 1.0);
}

@fragment
fn fs_copy(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(input_tex, input_sampler, in.uv);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_pass_has_an_entry_point_in_source() {
        for pass in BLOOM_PROGRAM.passes {
            let needle = format!("fn {}(", pass.entry_point());
            assert!(
                BLOOM_SHADER_SOURCE.contains(&needle),
                "missing entry point for {pass:?}"
            );
        }
        assert!(BLOOM_SHADER_SOURCE.contains("fn fs_copy("));
        assert!(BLOOM_SHADER_SOURCE.contains("fn vs_fullscreen("));
    }

    #[test]
    fn test_every_numeric_slot_is_declared() {
        for slot in BLOOM_PROGRAM.numeric_slots() {
            let needle = format!("{}:", slot.name());
            assert!(
                BLOOM_SHADER_SOURCE.contains(&needle),
                "uniform block is missing '{}'",
                slot.name()
            );
        }
        assert!(BLOOM_SHADER_SOURCE.contains("var dirt_tex"));
    }

    #[test]
    fn test_program_exposes_all_passes_and_slots() {
        for pass in BloomPass::ALL {
            assert!(BLOOM_PROGRAM.supports(pass));
        }
        assert_eq!(BLOOM_PROGRAM.uniforms.len(), 8);
        assert_eq!(BLOOM_PROGRAM.numeric_slots().count(), 7);
    }
}
