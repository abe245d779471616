//! CPU reference backend.
//!
//! Runs every pass of the bloom program on linear RGBA float images in main
//! memory. Slow, but deterministic and available everywhere, which makes it the
//! backend of choice for tests, offline tools, and machines without a GPU.

use std::collections::HashMap;

use glam::{Vec2, Vec3, Vec4};

use crate::backend::{
    BufferHandle, FilterMode, ImageId, RenderBackend, ScratchDesc, ScratchFormat, Surface,
};
use crate::error::BackendError;
use crate::mip_plan::Extent;
use crate::scratch_pool::{ScratchKey, ScratchPool};
use crate::uniforms::{BloomPass, BloomUniforms, MaterialState};

const LUMINANCE: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

/// A linear RGBA image stored row-major, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuImage {
    extent: Extent,
    pixels: Vec<Vec4>,
}

impl CpuImage {
    /// A transparent black image.
    pub fn new(extent: Extent) -> Self {
        Self::filled(extent, Vec4::ZERO)
    }

    pub fn filled(extent: Extent, color: Vec4) -> Self {
        Self {
            extent,
            pixels: vec![color; extent.texel_count() as usize],
        }
    }

    pub fn from_fn(extent: Extent, mut f: impl FnMut(u32, u32) -> Vec4) -> Self {
        let mut pixels = Vec::with_capacity(extent.texel_count() as usize);
        for y in 0..extent.height {
            for x in 0..extent.width {
                pixels.push(f(x, y));
            }
        }
        Self { extent, pixels }
    }

    /// Build from tightly packed RGBA8 bytes. Returns `None` on a length mismatch.
    pub fn from_rgba8(extent: Extent, bytes: &[u8]) -> Option<Self> {
        if bytes.len() as u64 != extent.texel_count() * 4 {
            return None;
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|c| Vec4::new(c[0] as f32, c[1] as f32, c[2] as f32, c[3] as f32) / 255.0)
            .collect();
        Some(Self { extent, pixels })
    }

    /// Tightly packed RGBA8 bytes, clamped to \[0, 1\].
    pub fn to_rgba8(&self) -> Vec<u8> {
        self.pixels
            .iter()
            .flat_map(|p| {
                let q = (p.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round();
                [q.x as u8, q.y as u8, q.z as u8, q.w as u8]
            })
            .collect()
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn pixels(&self) -> &[Vec4] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vec4 {
        self.pixels[y as usize * self.extent.width as usize + x as usize]
    }

    /// Clamp-to-edge texel fetch with signed coordinates.
    fn texel(&self, x: i64, y: i64) -> Vec4 {
        let x = x.clamp(0, i64::from(self.extent.width) - 1) as u32;
        let y = y.clamp(0, i64::from(self.extent.height) - 1) as u32;
        self.pixel(x, y)
    }

    /// Sample at normalized coordinates with clamp-to-edge addressing.
    pub fn sample(&self, uv: Vec2, filter: FilterMode) -> Vec4 {
        let w = self.extent.width as f32;
        let h = self.extent.height as f32;
        match filter {
            FilterMode::Nearest => self.texel((uv.x * w).floor() as i64, (uv.y * h).floor() as i64),
            FilterMode::Bilinear => {
                let x = uv.x * w - 0.5;
                let y = uv.y * h - 0.5;
                let (x0, y0) = (x.floor(), y.floor());
                let (fx, fy) = (x - x0, y - y0);
                let (ix, iy) = (x0 as i64, y0 as i64);
                let top = self.texel(ix, iy).lerp(self.texel(ix + 1, iy), fx);
                let bottom = self.texel(ix, iy + 1).lerp(self.texel(ix + 1, iy + 1), fx);
                top.lerp(bottom, fy)
            }
        }
    }

    fn quantize_unorm8(&mut self) {
        for p in &mut self.pixels {
            *p = (p.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round() / 255.0;
        }
    }
}

struct Scratch {
    image: CpuImage,
    key: ScratchKey,
    filter: FilterMode,
}

/// [`RenderBackend`] that shades on the CPU.
pub struct CpuBackend {
    images: HashMap<ImageId, CpuImage>,
    next_image: u32,
    live: HashMap<BufferHandle, Scratch>,
    next_handle: u64,
    pool: ScratchPool<CpuImage>,
    fail_allocation_at: Option<usize>,
    allocations: usize,
    releases: usize,
    passes: usize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            next_image: 0,
            live: HashMap::new(),
            next_handle: 0,
            pool: ScratchPool::new(),
            fail_allocation_at: None,
            allocations: 0,
            releases: 0,
            passes: 0,
        }
    }

    /// Limit scratch memory; allocations beyond it fail with `OutOfMemory`.
    pub fn with_memory_budget(mut self, bytes: Option<u64>) -> Self {
        self.pool.set_budget(bytes);
        self
    }

    /// Let the next `n` allocations succeed and fail the one after.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_allocation_at = Some(self.allocations + n + 1);
    }

    /// Register a host image and return its id.
    pub fn insert_image(&mut self, image: CpuImage) -> ImageId {
        let id = ImageId(self.next_image);
        self.next_image += 1;
        self.images.insert(id, image);
        id
    }

    pub fn image(&self, id: ImageId) -> Option<&CpuImage> {
        self.images.get(&id)
    }

    pub fn image_mut(&mut self, id: ImageId) -> Option<&mut CpuImage> {
        self.images.get_mut(&id)
    }

    pub fn remove_image(&mut self, id: ImageId) -> Option<CpuImage> {
        self.images.remove(&id)
    }

    /// Successful allocations since creation.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn releases(&self) -> usize {
        self.releases
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Scratch buffers currently lent out.
    pub fn live_buffers(&self) -> usize {
        self.live.len()
    }

    pub fn pool(&self) -> &ScratchPool<CpuImage> {
        &self.pool
    }

    fn surface(&self, surface: Surface) -> Option<(&CpuImage, FilterMode)> {
        match surface {
            Surface::Image(id) => self.images.get(&id).map(|i| (i, FilterMode::Bilinear)),
            Surface::Scratch(h) => self.live.get(&h).map(|s| (&s.image, s.filter)),
        }
    }

    fn surface_mut(&mut self, surface: Surface) -> Option<&mut CpuImage> {
        match surface {
            Surface::Image(id) => self.images.get_mut(&id),
            Surface::Scratch(h) => self.live.get_mut(&h).map(|s| &mut s.image),
        }
    }

    fn write(&mut self, destination: Surface, rendered: CpuImage, additive: bool) {
        let unorm8 = match destination {
            Surface::Scratch(h) => self
                .live
                .get(&h)
                .is_some_and(|s| s.key.format == ScratchFormat::Rgba8Unorm),
            Surface::Image(_) => false,
        };
        let Some(dst) = self.surface_mut(destination) else {
            return;
        };
        if additive {
            for (d, r) in dst.pixels.iter_mut().zip(&rendered.pixels) {
                *d += *r;
            }
        } else {
            *dst = rendered;
        }
        if unorm8 {
            dst.quantize_unorm8();
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for CpuBackend {
    fn allocate(&mut self, desc: &ScratchDesc) -> Result<BufferHandle, BackendError> {
        if let Some(n) = self.fail_allocation_at
            && self.allocations + 1 >= n
        {
            self.fail_allocation_at = None;
            return Err(BackendError::OutOfMemory {
                requested: desc.byte_size(),
                available: 0,
            });
        }

        let key = ScratchKey::from(desc);
        let image = self.pool.acquire(key, || CpuImage::new(desc.extent))?;

        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.live.insert(
            handle,
            Scratch {
                image,
                key,
                filter: desc.filter,
            },
        );
        self.allocations += 1;
        Ok(handle)
    }

    fn run_pass(
        &mut self,
        source: Surface,
        destination: Surface,
        pass: BloomPass,
        material: &MaterialState,
    ) {
        let Some(target) = self.surface(destination).map(|(i, _)| i.extent()) else {
            log::error!("{} skipped: unknown destination {destination:?}", pass.label());
            return;
        };
        let Some((input, filter)) = self.surface(source) else {
            log::error!("{} skipped: unknown source {source:?}", pass.label());
            return;
        };
        let dirt = material.active_dirt().and_then(|id| self.images.get(&id));

        let rendered = shade(pass, input, filter, dirt, target, &material.uniforms());
        self.write(destination, rendered, pass.is_additive());
        self.passes += 1;
    }

    fn release(&mut self, buffer: BufferHandle) {
        match self.live.remove(&buffer) {
            Some(scratch) => {
                self.pool.release(scratch.key, scratch.image);
                self.releases += 1;
            }
            None => log::error!("Release of {buffer:?} ignored: not lent out"),
        }
    }

    fn passthrough_copy(&mut self, source: Surface, destination: Surface) {
        let Some(target) = self.surface(destination).map(|(i, _)| i.extent()) else {
            log::error!("Copy skipped: unknown destination {destination:?}");
            return;
        };
        let Some((input, filter)) = self.surface(source) else {
            log::error!("Copy skipped: unknown source {source:?}");
            return;
        };
        let copied = if input.extent() == target {
            input.clone()
        } else {
            CpuImage::from_fn(target, |x, y| input.sample(texel_center(x, y, target), filter))
        };
        self.write(destination, copied, false);
    }
}

fn texel_center(x: u32, y: u32, extent: Extent) -> Vec2 {
    Vec2::new(
        (x as f32 + 0.5) / extent.width as f32,
        (y as f32 + 0.5) / extent.height as f32,
    )
}

/// Soft-knee luminance threshold.
fn soft_threshold(color: Vec3, threshold: f32, knee_strength: f32) -> Vec3 {
    let lum = color.dot(LUMINANCE);
    let knee = threshold * knee_strength * 0.5 + 0.0001;
    let soft = (lum - threshold + knee).clamp(0.0, 2.0 * knee);
    let curve = soft * soft / (4.0 * knee);
    let factor = (lum - threshold).max(curve) / lum.max(0.0001);
    color * factor.max(0.0)
}

fn four_tap(input: &CpuImage, filter: FilterMode, uv: Vec2, offset: Vec2) -> Vec3 {
    let taps = [
        Vec2::new(-offset.x, -offset.y),
        Vec2::new(offset.x, -offset.y),
        Vec2::new(-offset.x, offset.y),
        Vec2::new(offset.x, offset.y),
    ];
    taps.iter()
        .map(|o| input.sample(uv + *o, filter).truncate())
        .sum::<Vec3>()
        * 0.25
}

fn shade(
    pass: BloomPass,
    input: &CpuImage,
    filter: FilterMode,
    dirt: Option<&CpuImage>,
    target: Extent,
    params: &BloomUniforms,
) -> CpuImage {
    let input_texel = Vec2::new(
        1.0 / input.extent().width as f32,
        1.0 / input.extent().height as f32,
    );
    CpuImage::from_fn(target, |x, y| {
        let uv = texel_center(x, y, target);
        match pass {
            BloomPass::Extract => {
                let color = input.sample(uv, filter).truncate();
                soft_threshold(color, params.min_luminance, params.knee_strength).extend(1.0)
            }
            BloomPass::Downsample => four_tap(input, filter, uv, input_texel).extend(1.0),
            BloomPass::Upsample => {
                (four_tap(input, filter, uv, input_texel * 0.5) * params.blend_weight).extend(0.0)
            }
            BloomPass::Composite => {
                let bloom = input.sample(uv, filter).truncate();
                let mut result = bloom * params.intensity;
                if params.dirt_intensity > 0.0
                    && let Some(dirt) = dirt
                {
                    let d = dirt.sample(uv, FilterMode::Bilinear).truncate();
                    result += bloom * d * params.dirt_intensity;
                }
                result.extend(0.0)
            }
            BloomPass::Debug => input.sample(uv, filter).truncate().extend(1.0),
        }
    })
}
