//! wgpu render backend.
//!
//! Every pass is a fullscreen triangle drawn with the bloom shading program.
//! Scratch buffers are render-target textures pooled across frames. Work is
//! recorded into a single command encoder and flushed by [`WgpuBackend::submit`]
//! (or implicitly by [`WgpuBackend::read_rgba8`]).

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::backend::{BufferHandle, FilterMode, ImageId, RenderBackend, ScratchDesc, Surface};
use crate::error::BackendError;
use crate::mip_plan::Extent;
use crate::scratch_pool::{ScratchKey, ScratchPool};
use crate::shader::ShadingProgram;
use crate::uniforms::{BloomPass, BloomUniforms, MaterialState};

const SCRATCH_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::RENDER_ATTACHMENT
    .union(wgpu::TextureUsages::TEXTURE_BINDING)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::COPY_DST);

const ADDITIVE: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
};

/// A texture plus the default view passes read and write through.
struct GpuImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    extent: Extent,
}

impl GpuImage {
    fn new(
        device: &wgpu::Device,
        label: &str,
        extent: Extent,
        format: wgpu::TextureFormat,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: SCRATCH_USAGE,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            format,
            extent,
        }
    }

    fn size(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.extent.width,
            height: self.extent.height,
            depth_or_array_layers: 1,
        }
    }
}

struct LiveScratch {
    image: GpuImage,
    key: ScratchKey,
    filter: FilterMode,
}

/// Pipelines are keyed by fragment entry point and target format.
type PipelineKey = (&'static str, wgpu::TextureFormat);

/// [`RenderBackend`] that renders with wgpu.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    program: ShadingProgram,
    shader: wgpu::ShaderModule,
    uniform_bgl: wgpu::BindGroupLayout,
    texture_bgl: wgpu::BindGroupLayout,
    layout: wgpu::PipelineLayout,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    fallback_dirt: GpuImage,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    images: HashMap<ImageId, GpuImage>,
    next_image: u32,
    live: HashMap<BufferHandle, LiveScratch>,
    next_handle: u64,
    pool: ScratchPool<GpuImage>,
    encoder: Option<wgpu::CommandEncoder>,
    max_dimension: u32,
}

impl WgpuBackend {
    /// Compile `program` and build the shared binding state.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, program: &ShadingProgram) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.label),
            source: wgpu::ShaderSource::Wgsl(program.source.into()),
        });

        let uniform_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("bloom-uniforms-bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: std::num::NonZeroU64::new(
                        std::mem::size_of::<BloomUniforms>() as u64,
                    ),
                },
                count: None,
            }],
        });

        // Shared by the input (group 1) and dirt (group 2) bindings.
        let texture_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("bloom-texture-bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("bloom-layout"),
            bind_group_layouts: &[&uniform_bgl, &texture_bgl, &texture_bgl],
            immediate_size: 0,
        });

        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("bloom-linear-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("bloom-nearest-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let fallback_dirt = GpuImage::new(
            &device,
            "bloom-fallback-dirt",
            Extent::new(1, 1),
            wgpu::TextureFormat::Rgba8Unorm,
        );
        write_texture(&queue, &fallback_dirt, &[0, 0, 0, 255]);

        let max_dimension = device.limits().max_texture_dimension_2d;
        log::debug!(
            "Bloom backend ready: {} passes, max texture dimension {max_dimension}",
            program.passes.len()
        );

        Self {
            device,
            queue,
            program: *program,
            shader,
            uniform_bgl,
            texture_bgl,
            layout,
            linear_sampler,
            nearest_sampler,
            fallback_dirt,
            pipelines: HashMap::new(),
            images: HashMap::new(),
            next_image: 0,
            live: HashMap::new(),
            next_handle: 0,
            pool: ScratchPool::new(),
            encoder: None,
            max_dimension,
        }
    }

    /// Limit scratch texture memory; allocations beyond it fail with `OutOfMemory`.
    pub fn with_memory_budget(mut self, bytes: Option<u64>) -> Self {
        self.pool.set_budget(bytes);
        self
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Scratch textures waiting in the pool for reuse.
    pub fn pooled_buffers(&self) -> usize {
        self.pool.free_count()
    }

    /// Bytes held by scratch textures, pooled or lent out.
    pub fn scratch_memory(&self) -> u64 {
        self.pool.memory_allocated()
    }

    /// Create a host image usable as source, destination or dirt texture.
    pub fn create_image(
        &mut self,
        extent: Extent,
        format: wgpu::TextureFormat,
    ) -> Result<ImageId, BackendError> {
        self.check_extent(extent)?;
        let id = ImageId(self.next_image);
        let label = format!("bloom-image-{}", id.0);
        let image = GpuImage::new(&self.device, &label, extent, format);
        Ok(self.insert(id, image))
    }

    /// Register a texture created elsewhere. It must be 2D, filterable, and
    /// carry `TEXTURE_BINDING | RENDER_ATTACHMENT | COPY_SRC | COPY_DST` usage.
    pub fn register_texture(&mut self, texture: wgpu::Texture) -> ImageId {
        let extent = Extent::new(texture.width(), texture.height());
        let format = texture.format();
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = ImageId(self.next_image);
        self.insert(
            id,
            GpuImage {
                texture,
                view,
                format,
                extent,
            },
        )
    }

    pub fn texture(&self, id: ImageId) -> Option<&wgpu::Texture> {
        self.images.get(&id).map(|i| &i.texture)
    }

    pub fn remove_image(&mut self, id: ImageId) -> Option<wgpu::Texture> {
        self.images.remove(&id).map(|i| i.texture)
    }

    /// Upload tightly packed RGBA8 pixels into a 4-byte-per-texel image.
    pub fn upload_rgba8(&mut self, id: ImageId, bytes: &[u8]) -> Result<(), BackendError> {
        // Passes recorded so far must see the old contents.
        self.submit();
        let image = self.images.get(&id).ok_or(BackendError::UnknownImage(id))?;
        if image.format.block_copy_size(None) != Some(4) {
            return Err(BackendError::UnsupportedFormat(image.format));
        }
        let expected = image.extent.texel_count() as usize * 4;
        if bytes.len() != expected {
            return Err(BackendError::DataSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        write_texture(&self.queue, image, bytes);
        Ok(())
    }

    /// Flush recorded passes to the queue.
    pub fn submit(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    /// Submit pending work and read an RGBA8 image back, blocking until done.
    pub fn read_rgba8(&mut self, id: ImageId) -> Result<Vec<u8>, BackendError> {
        self.submit();
        let image = self.images.get(&id).ok_or(BackendError::UnknownImage(id))?;
        if image.format.block_copy_size(None) != Some(4) {
            return Err(BackendError::UnsupportedFormat(image.format));
        }

        let width = image.extent.width;
        let height = image.extent.height;
        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("bloom-readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("bloom-readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            image.size(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BackendError::Readback(e.to_string())),
            Err(e) => return Err(BackendError::Readback(e.to_string())),
        }

        let mapped = slice.get_mapped_range();
        let (unpadded, padded) = (unpadded as usize, padded as usize);
        let mut pixels = Vec::with_capacity(unpadded * height as usize);
        for start in (0..height as usize).map(|row| row * padded) {
            pixels.extend_from_slice(&mapped[start..start + unpadded]);
        }
        drop(mapped);
        buffer.unmap();
        Ok(pixels)
    }

    fn insert(&mut self, id: ImageId, image: GpuImage) -> ImageId {
        self.next_image += 1;
        self.images.insert(id, image);
        id
    }

    fn check_extent(&self, extent: Extent) -> Result<(), BackendError> {
        if extent.is_empty() {
            return Err(BackendError::ZeroExtent {
                width: extent.width,
                height: extent.height,
            });
        }
        if extent.max_dimension() > self.max_dimension {
            return Err(BackendError::ExtentTooLarge {
                width: extent.width,
                height: extent.height,
                limit: self.max_dimension,
            });
        }
        Ok(())
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("bloom-frame"),
                })
        })
    }

    fn surface(&self, surface: Surface) -> Option<(&GpuImage, FilterMode)> {
        match surface {
            Surface::Image(id) => self.images.get(&id).map(|i| (i, FilterMode::Bilinear)),
            Surface::Scratch(h) => self.live.get(&h).map(|s| (&s.image, s.filter)),
        }
    }

    fn sampler(&self, filter: FilterMode) -> &wgpu::Sampler {
        match filter {
            FilterMode::Nearest => &self.nearest_sampler,
            FilterMode::Bilinear => &self.linear_sampler,
        }
    }

    fn ensure_pipeline(
        &mut self,
        entry_point: &'static str,
        format: wgpu::TextureFormat,
        additive: bool,
    ) {
        if self.pipelines.contains_key(&(entry_point, format)) {
            return;
        }
        log::debug!("Creating bloom pipeline {entry_point} for {format:?}");
        let pipeline = create_fullscreen_pipeline(
            &self.device,
            &self.shader,
            &self.layout,
            self.program.vertex_entry_point,
            entry_point,
            format,
            additive.then_some(ADDITIVE),
        );
        self.pipelines.insert((entry_point, format), pipeline);
    }

    fn texture_bind_group(
        &self,
        label: &str,
        view: &wgpu::TextureView,
        sampler: &wgpu::Sampler,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.texture_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    /// Record one fullscreen draw from `source` into `destination`.
    fn draw(
        &mut self,
        source: Surface,
        destination: Surface,
        entry_point: &'static str,
        additive: bool,
        material: &MaterialState,
        label: &'static str,
    ) {
        if source == destination {
            log::error!("{label} skipped: {source:?} is both input and target");
            return;
        }
        let Some(format) = self.surface(destination).map(|(i, _)| i.format) else {
            log::error!("{label} skipped: unknown destination {destination:?}");
            return;
        };
        if self.surface(source).is_none() {
            log::error!("{label} skipped: unknown source {source:?}");
            return;
        }
        self.ensure_pipeline(entry_point, format, additive);
        let mut encoder = self.take_encoder();

        let resources = (
            self.surface(destination),
            self.surface(source),
            self.pipelines.get(&(entry_point, format)),
        );
        if let (Some((target, _)), Some((input, filter)), Some(pipeline)) = resources {
            // A fresh buffer per pass: each draw sees the values written before it.
            let uniform_buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("bloom-uniforms"),
                    contents: bytemuck::cast_slice(&[material.uniforms()]),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let uniform_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("bloom-uniforms-bg"),
                layout: &self.uniform_bgl,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                }],
            });
            let input_bg =
                self.texture_bind_group("bloom-input-bg", &input.view, self.sampler(filter));
            let dirt = material
                .active_dirt()
                .and_then(|id| self.images.get(&id))
                .unwrap_or(&self.fallback_dirt);
            let dirt_bg =
                self.texture_bind_group("bloom-dirt-bg", &dirt.view, &self.linear_sampler);

            let load = if additive {
                wgpu::LoadOp::Load
            } else {
                wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
            };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &uniform_bg, &[]);
            pass.set_bind_group(1, &input_bg, &[]);
            pass.set_bind_group(2, &dirt_bg, &[]);
            pass.draw(0..3, 0..1);
        }
        self.encoder = Some(encoder);
    }
}

impl RenderBackend for WgpuBackend {
    fn allocate(&mut self, desc: &ScratchDesc) -> Result<BufferHandle, BackendError> {
        self.check_extent(desc.extent)?;
        let key = ScratchKey::from(desc);
        let device = &self.device;
        let image = self.pool.acquire(key, || {
            GpuImage::new(device, &desc.name, desc.extent, desc.format.to_wgpu())
        })?;

        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.live.insert(
            handle,
            LiveScratch {
                image,
                key,
                filter: desc.filter,
            },
        );
        Ok(handle)
    }

    fn run_pass(
        &mut self,
        source: Surface,
        destination: Surface,
        pass: BloomPass,
        material: &MaterialState,
    ) {
        if !self.program.supports(pass) {
            log::error!("{} skipped: not part of {}", pass.label(), self.program.label);
            return;
        }
        self.draw(
            source,
            destination,
            pass.entry_point(),
            pass.is_additive(),
            material,
            pass.label(),
        );
    }

    fn release(&mut self, buffer: BufferHandle) {
        match self.live.remove(&buffer) {
            Some(scratch) => self.pool.release(scratch.key, scratch.image),
            None => log::error!("Release of {buffer:?} ignored: not lent out"),
        }
    }

    fn passthrough_copy(&mut self, source: Surface, destination: Surface) {
        let same_layout = match (self.surface(source), self.surface(destination)) {
            (Some((src, _)), Some((dst, _))) => {
                src.extent == dst.extent && src.format == dst.format
            }
            _ => false,
        };
        if !same_layout || source == destination {
            // Format or size conversion goes through the copy shader.
            let copy = self.program.copy_entry_point;
            let material = MaterialState::default();
            self.draw(source, destination, copy, false, &material, "bloom-copy");
            return;
        }

        let mut encoder = self.take_encoder();
        if let (Some((src, _)), Some((dst, _))) =
            (self.surface(source), self.surface(destination))
        {
            encoder.copy_texture_to_texture(
                src.texture.as_image_copy(),
                dst.texture.as_image_copy(),
                src.size(),
            );
        }
        self.encoder = Some(encoder);
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        self.submit();
    }
}

fn write_texture(queue: &wgpu::Queue, image: &GpuImage, bytes: &[u8]) {
    let bytes_per_pixel = image.format.block_copy_size(None).unwrap_or(4);
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &image.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytes,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(image.extent.width * bytes_per_pixel),
            rows_per_image: None,
        },
        image.size(),
    );
}

/// Create a fullscreen render pipeline with the given fragment entry point.
fn create_fullscreen_pipeline(
    device: &wgpu::Device,
    shader: &wgpu::ShaderModule,
    layout: &wgpu::PipelineLayout,
    vertex_entry: &str,
    fragment_entry: &str,
    target_format: wgpu::TextureFormat,
    blend: Option<wgpu::BlendState>,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(fragment_entry),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some(vertex_entry),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some(fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format: target_format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview_mask: None,
        cache: None,
    })
}
