//! The render capability the bloom pyramid drives.
//!
//! A backend owns images and a pool of scratch buffers and knows how to run the
//! passes of the bloom shading program. [`BloomPyramid`](crate::BloomPyramid)
//! only decides which pass runs between which surfaces and with which uniform
//! values; it never touches pixels.

use crate::error::BackendError;
use crate::mip_plan::Extent;
use crate::uniforms::{BloomPass, MaterialState};

/// A host-owned image registered with a backend (source, destination, dirt texture).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub u32);

/// A scratch buffer borrowed from a backend's pool for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Anything a pass can read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Image(ImageId),
    Scratch(BufferHandle),
}

/// Pixel format of a scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScratchFormat {
    /// Half-float RGBA; keeps HDR highlights above 1.0 through the pyramid.
    #[default]
    Rgba16Float,
    /// 8-bit normalized RGBA for devices or tools without float targets.
    Rgba8Unorm,
}

impl ScratchFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ScratchFormat::Rgba16Float => 8,
            ScratchFormat::Rgba8Unorm => 4,
        }
    }

    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            ScratchFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            ScratchFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

/// How a scratch buffer is sampled when a later pass reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Bilinear,
}

/// Request for one scratch buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchDesc {
    /// Debug name, e.g. `bloom-mip-3`.
    pub name: String,
    pub extent: Extent,
    pub format: ScratchFormat,
    pub filter: FilterMode,
}

impl ScratchDesc {
    /// Descriptor for pyramid level `level`.
    pub fn for_level(level: u32, extent: Extent, format: ScratchFormat) -> Self {
        Self {
            name: format!("bloom-mip-{level}"),
            extent,
            format,
            filter: FilterMode::Bilinear,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.extent.texel_count() * u64::from(self.format.bytes_per_pixel())
    }
}

/// Render capability consumed by the bloom pyramid.
///
/// `allocate` and `release` are pool bookkeeping; `run_pass` and
/// `passthrough_copy` only record work and must not block on the device.
/// Implementations ignore (and log) a `release` of a handle they do not
/// currently lend out, so a buggy caller cannot corrupt the pool.
pub trait RenderBackend {
    /// Borrow a scratch buffer from the pool.
    fn allocate(&mut self, desc: &ScratchDesc) -> Result<BufferHandle, BackendError>;

    /// Run one pass of the bloom shading program from `source` into `destination`.
    fn run_pass(
        &mut self,
        source: Surface,
        destination: Surface,
        pass: BloomPass,
        material: &MaterialState,
    );

    /// Return a scratch buffer to the pool. Its contents must not be read afterwards.
    fn release(&mut self, buffer: BufferHandle);

    /// Copy `source` into `destination` unchanged.
    fn passthrough_copy(&mut self, source: Surface, destination: Surface);
}

impl<B: RenderBackend + ?Sized> RenderBackend for &mut B {
    fn allocate(&mut self, desc: &ScratchDesc) -> Result<BufferHandle, BackendError> {
        (**self).allocate(desc)
    }

    fn run_pass(
        &mut self,
        source: Surface,
        destination: Surface,
        pass: BloomPass,
        material: &MaterialState,
    ) {
        (**self).run_pass(source, destination, pass, material);
    }

    fn release(&mut self, buffer: BufferHandle) {
        (**self).release(buffer);
    }

    fn passthrough_copy(&mut self, source: Surface, destination: Surface) {
        (**self).passthrough_copy(source, destination);
    }
}
