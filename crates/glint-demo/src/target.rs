//! The backend a run renders with, plus image transfer in and out of it.

use glint_config::BackendKind;
use glint_render::{
    BLOOM_PROGRAM, BackendError, CpuBackend, CpuImage, Extent, ImageId, RenderBackend,
    WgpuBackend,
};
use image::RgbaImage;

pub enum Target {
    Cpu(CpuBackend),
    Gpu(WgpuBackend),
}

impl Target {
    /// Create the requested backend. A missing GPU adapter falls back to the CPU.
    pub fn create(kind: BackendKind, memory_budget: Option<u64>) -> Self {
        match kind {
            BackendKind::Cpu => Target::Cpu(CpuBackend::new().with_memory_budget(memory_budget)),
            BackendKind::Wgpu => match request_device() {
                Some((device, queue)) => Target::Gpu(
                    WgpuBackend::new(device, queue, &BLOOM_PROGRAM)
                        .with_memory_budget(memory_budget),
                ),
                None => {
                    tracing::warn!("No GPU adapter available, using the CPU backend");
                    Target::Cpu(CpuBackend::new().with_memory_budget(memory_budget))
                }
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Target::Cpu(_) => "cpu",
            Target::Gpu(_) => "wgpu",
        }
    }

    pub fn backend(&mut self) -> &mut dyn RenderBackend {
        match self {
            Target::Cpu(backend) => backend,
            Target::Gpu(backend) => backend,
        }
    }

    /// Register `image` with the backend.
    pub fn upload(&mut self, image: &RgbaImage) -> Result<ImageId, BackendError> {
        let extent = Extent::new(image.width(), image.height());
        match self {
            Target::Cpu(backend) => {
                let pixels = CpuImage::from_rgba8(extent, image.as_raw()).ok_or(
                    BackendError::DataSizeMismatch {
                        expected: extent.texel_count() as usize * 4,
                        actual: image.as_raw().len(),
                    },
                )?;
                Ok(backend.insert_image(pixels))
            }
            Target::Gpu(backend) => {
                let id = backend.create_image(extent, wgpu::TextureFormat::Rgba8Unorm)?;
                backend.upload_rgba8(id, image.as_raw())?;
                Ok(id)
            }
        }
    }

    /// Read an image back, waiting for any pending GPU work.
    pub fn download(&mut self, id: ImageId) -> Result<RgbaImage, BackendError> {
        let (extent, bytes) = match self {
            Target::Cpu(backend) => {
                let image = backend.image(id).ok_or(BackendError::UnknownImage(id))?;
                (image.extent(), image.to_rgba8())
            }
            Target::Gpu(backend) => {
                let extent = backend
                    .texture(id)
                    .map(|t| Extent::new(t.width(), t.height()))
                    .ok_or(BackendError::UnknownImage(id))?;
                (extent, backend.read_rgba8(id)?)
            }
        };
        let actual = bytes.len();
        RgbaImage::from_raw(extent.width, extent.height, bytes).ok_or(
            BackendError::DataSizeMismatch {
                expected: extent.texel_count() as usize * 4,
                actual,
            },
        )
    }
}

fn request_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok()?;
        tracing::info!(adapter = %adapter.get_info().name, "Using GPU adapter");
        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("glint-device"),
                ..Default::default()
            })
            .await
            .ok()
    })
}
