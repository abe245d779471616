//! Multi-resolution bloom: extract bright regions, blur them through a mip
//! pyramid, and composite the glow back onto the image.
//!
//! One [`BloomPyramid::process`] call is one frame:
//!
//! 1. Extract: source → level 0 at full resolution (soft-knee threshold).
//! 2. Downsample: level `i-1` → level `i` at half size, for `i = 1..=M`.
//! 3. Upsample: for `i = M..=2`, level `i` is added onto level `i-1` scaled by
//!    the blend weight, then released.
//! 4. Composite: source is copied to the destination, bloom (level 1) is added
//!    on top, optionally replaced by the debug view, and the remaining levels
//!    are released.
//!
//! Every scratch buffer borrowed in step 1–2 is returned exactly once, whether
//! the frame completes or aborts.

use crate::backend::{BufferHandle, ImageId, RenderBackend, ScratchDesc, ScratchFormat, Surface};
use crate::error::BloomError;
use crate::mip_plan::{Extent, MIN_UPSAMPLE_LEVEL, MipPlan};
use crate::settings::BloomSettings;
use crate::uniforms::{BloomPass, MaterialState, UniformSlot, UniformValue};

/// The host image a frame reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceImage {
    pub id: ImageId,
    pub extent: Extent,
}

impl SourceImage {
    pub fn new(id: ImageId, width: u32, height: u32) -> Self {
        Self {
            id,
            extent: Extent::new(width, height),
        }
    }
}

/// Summary of one successfully processed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub mip_level: u32,
    pub mip_level_float: f32,
    pub buffers_allocated: usize,
    pub buffers_released: usize,
    pub upsample_iterations: usize,
    /// Shading passes submitted, excluding the passthrough copy.
    pub passes: usize,
}

impl FrameReport {
    /// Every borrowed buffer went back to the pool.
    pub fn is_balanced(&self) -> bool {
        self.buffers_allocated == self.buffers_released
    }
}

/// The bloom post-effect.
///
/// Holds only the settings snapshot and the material derived from it; all
/// scratch buffers live for a single [`process`](Self::process) call.
#[derive(Debug, Clone)]
pub struct BloomPyramid {
    settings: BloomSettings,
    material: MaterialState,
    needs_rebuild: bool,
    scratch_format: ScratchFormat,
}

impl BloomPyramid {
    pub fn new(settings: BloomSettings) -> Self {
        let settings = settings.validated();
        Self {
            material: MaterialState::from_settings(&settings),
            settings,
            needs_rebuild: false,
            scratch_format: ScratchFormat::default(),
        }
    }

    /// Use a different pixel format for the pyramid levels.
    pub fn with_scratch_format(mut self, format: ScratchFormat) -> Self {
        self.scratch_format = format;
        self
    }

    pub fn scratch_format(&self) -> ScratchFormat {
        self.scratch_format
    }

    /// Current (validated) settings snapshot.
    pub fn settings(&self) -> &BloomSettings {
        &self.settings
    }

    /// Replace the whole settings snapshot. Values are clamped now and the
    /// material is rebuilt before the next frame.
    pub fn set_settings(&mut self, settings: BloomSettings) {
        self.settings = settings.validated();
        self.mark_needs_rebuild();
    }

    /// Force the material to be rebuilt from the settings on the next frame.
    pub fn mark_needs_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Apply bloom to `source` and write the result into `destination`.
    ///
    /// On error the destination is left untouched and every scratch buffer
    /// allocated during the call has been released.
    pub fn process<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        source: SourceImage,
        destination: ImageId,
    ) -> Result<FrameReport, BloomError> {
        let plan = MipPlan::for_source(source.extent)?;

        if self.needs_rebuild {
            self.material = MaterialState::from_settings(&self.settings);
            self.needs_rebuild = false;
        }
        let mut material = self.material;
        material.set(
            UniformSlot::MipLevel,
            UniformValue::Float(plan.mip_level_float()),
        );

        let mut levels = LevelBuffers::new(backend, plan.level_count());

        // Downsample: every level reads the one before it, never the source again.
        let mut last = Surface::Image(source.id);
        for (level, &extent) in plan.levels().iter().enumerate() {
            let level = level as u32;
            let pass = if level == 0 {
                BloomPass::Extract
            } else {
                BloomPass::Downsample
            };
            let current = levels.allocate(level, extent, self.scratch_format)?;
            levels.run_pass(last, Surface::Scratch(current), pass, &material);
            log::trace!("Bloom mip {level}: {}x{}", extent.width, extent.height);
            last = Surface::Scratch(current);
        }

        // Upsample: fold the accumulator into the next finer level, then drop it.
        let mut upsample_iterations = 0;
        for level in plan.upsample_levels() {
            let coarse = levels.get(level);
            let fine = levels.get(level - 1);
            material.set(
                UniformSlot::BlendWeight,
                UniformValue::Float(plan.blend_weight(level)),
            );
            levels.run_pass(coarse, fine, BloomPass::Upsample, &material);
            levels.release(level);
            upsample_iterations += 1;
        }

        // Composite.
        let bloom = levels.get(MIN_UPSAMPLE_LEVEL);
        let src = Surface::Image(source.id);
        let dst = Surface::Image(destination);
        levels.passthrough_copy(src, dst);
        levels.run_pass(bloom, dst, BloomPass::Composite, &material);
        if self.settings.debug_on {
            levels.run_pass(bloom, dst, BloomPass::Debug, &material);
        }

        let counts = levels.finish();
        let report = FrameReport {
            mip_level: plan.mip_level(),
            mip_level_float: plan.mip_level_float(),
            buffers_allocated: counts.allocated,
            buffers_released: counts.released,
            upsample_iterations,
            passes: counts.passes,
        };
        log::debug!(
            "Bloom frame {}x{}: mip {:.3}, {} passes, {} buffers",
            source.extent.width,
            source.extent.height,
            report.mip_level_float,
            report.passes,
            report.buffers_allocated
        );
        Ok(report)
    }
}

impl Default for BloomPyramid {
    fn default() -> Self {
        Self::new(BloomSettings::default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    allocated: usize,
    released: usize,
    passes: usize,
}

/// Scratch buffers of one frame, indexed by pyramid level.
///
/// A slot is emptied the moment its buffer is released, so a buffer can be
/// returned at most once. Whatever is still held when the guard is dropped
/// (early return, `?`, or [`finish`](Self::finish)) goes back to the backend.
struct LevelBuffers<'a, B: RenderBackend + ?Sized> {
    backend: &'a mut B,
    slots: Vec<Option<BufferHandle>>,
    counts: Counts,
}

impl<'a, B: RenderBackend + ?Sized> LevelBuffers<'a, B> {
    fn new(backend: &'a mut B, levels: usize) -> Self {
        Self {
            backend,
            slots: vec![None; levels],
            counts: Counts::default(),
        }
    }

    fn allocate(
        &mut self,
        level: u32,
        extent: Extent,
        format: ScratchFormat,
    ) -> Result<BufferHandle, BloomError> {
        let desc = ScratchDesc::for_level(level, extent, format);
        match self.backend.allocate(&desc) {
            Ok(handle) => {
                self.slots[level as usize] = Some(handle);
                self.counts.allocated += 1;
                Ok(handle)
            }
            Err(source) => {
                log::warn!(
                    "Bloom frame aborted: level {level} ({}x{}) allocation failed: {source}",
                    extent.width,
                    extent.height
                );
                Err(BloomError::AllocationFailure {
                    level,
                    extent,
                    source,
                })
            }
        }
    }

    /// Surface for a level that is still held.
    fn get(&self, level: u32) -> Surface {
        match self.slots[level as usize] {
            Some(handle) => Surface::Scratch(handle),
            None => unreachable!("bloom level {level} read after release"),
        }
    }

    fn run_pass(
        &mut self,
        source: Surface,
        destination: Surface,
        pass: BloomPass,
        material: &MaterialState,
    ) {
        self.backend.run_pass(source, destination, pass, material);
        self.counts.passes += 1;
    }

    fn passthrough_copy(&mut self, source: Surface, destination: Surface) {
        self.backend.passthrough_copy(source, destination);
    }

    fn release(&mut self, level: u32) {
        if let Some(handle) = self.slots[level as usize].take() {
            self.backend.release(handle);
            self.counts.released += 1;
        }
    }

    fn release_all(&mut self) {
        for level in 0..self.slots.len() {
            self.release(level as u32);
        }
    }

    fn finish(mut self) -> Counts {
        self.release_all();
        self.counts
    }
}

impl<B: RenderBackend + ?Sized> Drop for LevelBuffers<'_, B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Allocate(ScratchDesc),
        Pass(Surface, Surface, BloomPass, MaterialState),
        Release(BufferHandle),
        Copy(Surface, Surface),
    }

    /// Records every call; optionally fails the n-th allocation (1-based).
    struct MockBackend {
        calls: Vec<Call>,
        next: u64,
        fail_on: Option<usize>,
        allocations: usize,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                next: 0,
                fail_on: None,
                allocations: 0,
            }
        }

        fn failing_on(n: usize) -> Self {
            Self {
                fail_on: Some(n),
                ..Self::new()
            }
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }

        fn allocates(&self) -> usize {
            self.count(|c| matches!(c, Call::Allocate(_)))
        }

        fn releases(&self) -> Vec<BufferHandle> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Release(h) => Some(*h),
                    _ => None,
                })
                .collect()
        }

        fn passes(&self) -> Vec<(Surface, Surface, BloomPass, MaterialState)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Pass(s, d, p, m) => Some((*s, *d, *p, *m)),
                    _ => None,
                })
                .collect()
        }

        fn touched_destination(&self, destination: ImageId) -> bool {
            let dst = Surface::Image(destination);
            self.calls.iter().any(|c| match c {
                Call::Pass(_, d, _, _) | Call::Copy(_, d) => *d == dst,
                _ => false,
            })
        }
    }

    impl RenderBackend for MockBackend {
        fn allocate(&mut self, desc: &ScratchDesc) -> Result<BufferHandle, BackendError> {
            self.allocations += 1;
            if self.fail_on == Some(self.allocations) {
                return Err(BackendError::OutOfMemory {
                    requested: desc.byte_size(),
                    available: 0,
                });
            }
            self.calls.push(Call::Allocate(desc.clone()));
            self.next += 1;
            Ok(BufferHandle(self.next))
        }

        fn run_pass(
            &mut self,
            source: Surface,
            destination: Surface,
            pass: BloomPass,
            material: &MaterialState,
        ) {
            self.calls
                .push(Call::Pass(source, destination, pass, *material));
        }

        fn release(&mut self, buffer: BufferHandle) {
            self.calls.push(Call::Release(buffer));
        }

        fn passthrough_copy(&mut self, source: Surface, destination: Surface) {
            self.calls.push(Call::Copy(source, destination));
        }
    }

    const SRC: ImageId = ImageId(100);
    const DST: ImageId = ImageId(200);

    fn scratch(n: u64) -> Surface {
        Surface::Scratch(BufferHandle(n))
    }

    #[test]
    fn test_1024_frame_builds_six_levels_and_blends_four_times() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();

        let report = bloom
            .process(&mut backend, SourceImage::new(SRC, 1024, 1024), DST)
            .unwrap();

        assert_eq!(report.mip_level, 5);
        assert_eq!(report.buffers_allocated, 6);
        assert_eq!(report.upsample_iterations, 4);
        assert!(report.is_balanced());
        assert_eq!(backend.allocates(), 6);
        assert_eq!(backend.releases().len(), 6);

        let passes = backend.passes();
        let kinds: Vec<_> = passes.iter().map(|p| p.2).collect();
        assert_eq!(
            kinds,
            vec![
                BloomPass::Extract,
                BloomPass::Downsample,
                BloomPass::Downsample,
                BloomPass::Downsample,
                BloomPass::Downsample,
                BloomPass::Downsample,
                BloomPass::Upsample,
                BloomPass::Upsample,
                BloomPass::Upsample,
                BloomPass::Upsample,
                BloomPass::Composite,
            ]
        );
        assert_eq!(report.passes, kinds.len());
    }

    #[test]
    fn test_downsample_chain_reads_previous_level() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 1024, 1024), DST)
            .unwrap();

        let passes = backend.passes();
        assert_eq!(passes[0].0, Surface::Image(SRC));
        assert_eq!(passes[0].1, scratch(1));
        for i in 1..=5u64 {
            assert_eq!(passes[i as usize].0, scratch(i));
            assert_eq!(passes[i as usize].1, scratch(i + 1));
        }

        let sizes: Vec<_> = backend
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Allocate(desc) => Some((desc.extent.width, desc.name.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(sizes[0], (1024, "bloom-mip-0".to_string()));
        assert_eq!(sizes[5], (32, "bloom-mip-5".to_string()));
    }

    #[test]
    fn test_upsample_blends_into_finer_level_and_releases_coarse() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 1024, 1024), DST)
            .unwrap();

        // Handles are 1-based: level n lives in BufferHandle(n + 1).
        let ups: Vec<_> = backend
            .passes()
            .into_iter()
            .filter(|p| p.2 == BloomPass::Upsample)
            .collect();
        let pairs: Vec<_> = ups.iter().map(|p| (p.0, p.1)).collect();
        assert_eq!(
            pairs,
            vec![
                (scratch(6), scratch(5)),
                (scratch(5), scratch(4)),
                (scratch(4), scratch(3)),
                (scratch(3), scratch(2)),
            ]
        );

        // log2(33) ~= 5.044: only the coarsest level is faded.
        let w5 = ups[0].3.uniforms().blend_weight;
        assert!(w5 > 0.0 && w5 < 0.1, "got {w5}");
        assert!(ups[1..].iter().all(|p| p.3.uniforms().blend_weight == 1.0));

        // Coarse buffers are released right after they are consumed, in order.
        assert_eq!(
            &backend.releases()[..4],
            &[BufferHandle(6), BufferHandle(5), BufferHandle(4), BufferHandle(3)]
        );
        let first_release = backend
            .calls
            .iter()
            .position(|c| *c == Call::Release(BufferHandle(6)))
            .unwrap();
        let first_upsample = backend
            .calls
            .iter()
            .position(|c| matches!(c, Call::Pass(_, _, BloomPass::Upsample, _)))
            .unwrap();
        assert_eq!(first_release, first_upsample + 1);
    }

    #[test]
    fn test_composite_copies_then_adds_final_bloom() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 1024, 1024), DST)
            .unwrap();

        let copy_at = backend
            .calls
            .iter()
            .position(|c| *c == Call::Copy(Surface::Image(SRC), Surface::Image(DST)))
            .unwrap();
        match &backend.calls[copy_at + 1] {
            Call::Pass(src, dst, BloomPass::Composite, material) => {
                assert_eq!(*src, scratch(2));
                assert_eq!(*dst, Surface::Image(DST));
                assert_eq!(material.uniforms().intensity, 0.25);
                assert_eq!(material.uniforms().dirt_intensity, 0.0);
                assert_eq!(material.dirt_texture(), None);
            }
            other => panic!("expected composite, got {other:?}"),
        }

        // Levels 0 and 1 are released last, after compositing.
        assert_eq!(
            &backend.releases()[4..],
            &[BufferHandle(1), BufferHandle(2)]
        );
    }

    #[test]
    fn test_small_source_skips_upsample() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();
        let report = bloom
            .process(&mut backend, SourceImage::new(SRC, 16, 16), DST)
            .unwrap();

        assert_eq!(report.mip_level, 1);
        assert_eq!(report.mip_level_float, 1.0);
        assert_eq!(report.upsample_iterations, 0);
        assert_eq!(report.buffers_allocated, 2);
        assert!(report.is_balanced());

        let kinds: Vec<_> = backend.passes().iter().map(|p| p.2).collect();
        assert_eq!(
            kinds,
            vec![
                BloomPass::Extract,
                BloomPass::Downsample,
                BloomPass::Composite
            ]
        );
        // Final bloom is level 1: the single downsample of level 0.
        assert_eq!(backend.passes()[2].0, scratch(2));
    }

    #[test]
    fn test_allocation_failure_on_third_call_releases_two() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::failing_on(3);

        let err = bloom
            .process(&mut backend, SourceImage::new(SRC, 1024, 1024), DST)
            .unwrap_err();

        assert!(matches!(
            err,
            BloomError::AllocationFailure {
                level: 2,
                extent: Extent {
                    width: 256,
                    height: 256
                },
                ..
            }
        ));
        assert_eq!(backend.allocates(), 2);
        assert_eq!(backend.releases(), vec![BufferHandle(1), BufferHandle(2)]);
        assert!(!backend.touched_destination(DST));
    }

    #[test]
    fn test_invalid_dimensions_fail_before_any_call() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();

        let err = bloom
            .process(&mut backend, SourceImage::new(SRC, 0, 480), DST)
            .unwrap_err();

        assert_eq!(
            err,
            BloomError::InvalidFrameDimensions {
                width: 0,
                height: 480
            }
        );
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn test_debug_overwrites_with_final_bloom() {
        let mut bloom = BloomPyramid::new(BloomSettings {
            debug_on: true,
            ..Default::default()
        });
        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 256, 256), DST)
            .unwrap();

        let passes = backend.passes();
        let (composite, debug) = (&passes[passes.len() - 2], &passes[passes.len() - 1]);
        assert_eq!(composite.2, BloomPass::Composite);
        assert_eq!(debug.2, BloomPass::Debug);
        assert_eq!(debug.0, composite.0);
        assert_eq!(debug.1, Surface::Image(DST));
    }

    #[test]
    fn test_every_frame_balances_allocations() {
        let mut bloom = BloomPyramid::default();
        for (w, h) in [(1, 1), (31, 7), (640, 480), (1920, 1080), (8192, 64)] {
            let mut backend = MockBackend::new();
            let report = bloom
                .process(&mut backend, SourceImage::new(SRC, w, h), DST)
                .unwrap();
            assert_eq!(backend.allocates(), backend.releases().len(), "{w}x{h}");
            assert_eq!(report.buffers_allocated, report.mip_level as usize + 1);
            assert!(report.is_balanced());
        }
        for fail_on in 1..=6 {
            let mut backend = MockBackend::failing_on(fail_on);
            assert!(
                bloom
                    .process(&mut backend, SourceImage::new(SRC, 1024, 1024), DST)
                    .is_err()
            );
            assert_eq!(backend.allocates(), backend.releases().len());
            assert_eq!(backend.allocates(), fail_on - 1);
        }
    }

    #[test]
    fn test_no_buffer_released_twice() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 4096, 2160), DST)
            .unwrap();
        let mut released = backend.releases();
        let total = released.len();
        released.sort_by_key(|h| h.0);
        released.dedup();
        assert_eq!(released.len(), total);
    }

    #[test]
    fn test_mip_level_uniform_is_fractional() {
        let mut bloom = BloomPyramid::default();
        let mut backend = MockBackend::new();
        let report = bloom
            .process(&mut backend, SourceImage::new(SRC, 1280, 720), DST)
            .unwrap();
        assert!(
            backend
                .passes()
                .iter()
                .all(|p| p.3.uniforms().mip_level == report.mip_level_float)
        );
        assert!(report.mip_level_float.fract() > 0.0);
    }

    #[test]
    fn test_settings_are_clamped_and_material_rebuilt() {
        let mut bloom = BloomPyramid::default();
        bloom.set_settings(BloomSettings {
            intensity: 4.0,
            dirt_texture: Some(ImageId(9)),
            dirt_intensity: 0.75,
            ..Default::default()
        });
        assert_eq!(bloom.settings().intensity, 1.0);
        assert!(bloom.needs_rebuild());

        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 64, 64), DST)
            .unwrap();
        assert!(!bloom.needs_rebuild());

        let composite = backend
            .passes()
            .into_iter()
            .find(|p| p.2 == BloomPass::Composite)
            .unwrap();
        assert_eq!(composite.3.uniforms().intensity, 1.0);
        assert_eq!(composite.3.uniforms().dirt_intensity, 0.75);
        assert_eq!(composite.3.dirt_texture(), Some(ImageId(9)));
    }

    fn composite_intensity(bloom: &mut BloomPyramid) -> f32 {
        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 64, 64), DST)
            .unwrap();
        backend
            .passes()
            .into_iter()
            .find(|p| p.2 == BloomPass::Composite)
            .unwrap()
            .3
            .uniforms()
            .intensity
    }

    #[test]
    fn test_material_rebuilt_only_when_marked() {
        let mut bloom = BloomPyramid::default();
        assert_eq!(composite_intensity(&mut bloom), 0.25);
        assert!(!bloom.needs_rebuild());

        // Settings changed behind the dirty flag are not picked up.
        bloom.settings.intensity = 0.9;
        assert_eq!(composite_intensity(&mut bloom), 0.25);

        bloom.mark_needs_rebuild();
        assert!(bloom.needs_rebuild());
        assert_eq!(composite_intensity(&mut bloom), 0.9);
        assert!(!bloom.needs_rebuild());

        bloom.set_settings(BloomSettings {
            intensity: 0.6,
            ..Default::default()
        });
        assert!(bloom.needs_rebuild());
        assert_eq!(bloom.material.uniforms().intensity, 0.9);
        assert_eq!(composite_intensity(&mut bloom), 0.6);
        assert!(!bloom.needs_rebuild());
    }

    #[test]
    fn test_scratch_format_is_forwarded() {
        let mut bloom = BloomPyramid::default().with_scratch_format(ScratchFormat::Rgba8Unorm);
        let mut backend = MockBackend::new();
        bloom
            .process(&mut backend, SourceImage::new(SRC, 64, 64), DST)
            .unwrap();
        assert!(backend.calls.iter().all(|c| match c {
            Call::Allocate(desc) => desc.format == ScratchFormat::Rgba8Unorm,
            _ => true,
        }));
    }
}
