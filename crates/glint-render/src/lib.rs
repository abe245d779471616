//! Screen-space bloom: mip-pyramid extraction, blur, and compositing over a pluggable render backend.

pub mod backend;
pub mod cpu;
pub mod error;
pub mod gpu;
pub mod mip_plan;
pub mod pyramid;
pub mod scratch_pool;
pub mod settings;
pub mod shader;
pub mod uniforms;

pub use backend::{
    BufferHandle, FilterMode, ImageId, RenderBackend, ScratchDesc, ScratchFormat, Surface,
};
pub use cpu::{CpuBackend, CpuImage};
pub use error::{BackendError, BloomError};
pub use gpu::WgpuBackend;
pub use mip_plan::{Extent, MAX_MIP_LEVEL, MIN_UPSAMPLE_LEVEL, MipPlan, mip_level_float};
pub use pyramid::{BloomPyramid, FrameReport, SourceImage};
pub use scratch_pool::{ScratchKey, ScratchPool};
pub use settings::BloomSettings;
pub use shader::{BLOOM_PROGRAM, BLOOM_SHADER_SOURCE, ShadingProgram};
pub use uniforms::{BloomPass, BloomUniforms, MaterialState, UniformSlot, UniformValue};
