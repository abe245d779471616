//! One invocation of the tool: load, bloom for N frames, save.

use std::path::Path;

use glint_config::{BloomConfig, Config};
use glint_render::{
    BloomPyramid, BloomSettings, FrameReport, ImageId, ScratchFormat, SourceImage,
};
use image::RgbaImage;

use crate::error::DemoError;
use crate::target::Target;

#[derive(Debug)]
pub struct RunSummary {
    pub backend: &'static str,
    pub frames: u32,
    pub last_report: FrameReport,
}

pub fn run(config: &Config, input: &Path, output: &Path) -> Result<RunSummary, DemoError> {
    let source = load(input)?;
    let (width, height) = source.dimensions();

    let mut target = Target::create(config.render.backend, config.render.memory_budget_bytes());
    let src = target.upload(&source)?;
    let dst = target.upload(&RgbaImage::new(width, height))?;
    let dirt = match &config.bloom.dirt_texture {
        Some(path) => Some(target.upload(&load(path)?)?),
        None => None,
    };

    let scratch_format = if config.render.hdr_scratch {
        ScratchFormat::Rgba16Float
    } else {
        ScratchFormat::Rgba8Unorm
    };
    let mut bloom =
        BloomPyramid::new(settings_from(&config.bloom, dirt)).with_scratch_format(scratch_format);

    let frames = config.render.frames.max(1);
    let source_image = SourceImage::new(src, width, height);
    let mut last_report = render_frame(&mut bloom, &mut target, source_image, dst, 0)?;
    for frame in 1..frames {
        last_report = render_frame(&mut bloom, &mut target, source_image, dst, frame)?;
    }

    let result = target.download(dst)?;
    result.save(output).map_err(|source| DemoError::Save {
        path: output.to_path_buf(),
        source,
    })?;

    tracing::info!(
        backend = target.name(),
        frames,
        width,
        height,
        mip_level = last_report.mip_level,
        "Wrote {}",
        output.display()
    );
    Ok(RunSummary {
        backend: target.name(),
        frames,
        last_report,
    })
}

fn render_frame(
    bloom: &mut BloomPyramid,
    target: &mut Target,
    source: SourceImage,
    destination: ImageId,
    frame: u32,
) -> Result<FrameReport, DemoError> {
    let report = bloom.process(target.backend(), source, destination)?;
    if !report.is_balanced() {
        return Err(DemoError::Unbalanced { frame, report });
    }
    tracing::debug!(
        frame,
        mip_level = report.mip_level,
        passes = report.passes,
        buffers = report.buffers_allocated,
        "Frame complete"
    );
    Ok(report)
}

/// Settings for the pyramid; the dirt path is replaced by the uploaded image.
pub fn settings_from(bloom: &BloomConfig, dirt: Option<ImageId>) -> BloomSettings {
    BloomSettings {
        intensity: bloom.intensity,
        dirt_intensity: bloom.dirt_intensity,
        dirt_texture: dirt,
        min_luminance: bloom.min_luminance,
        knee_strength: bloom.knee_strength,
        debug_on: bloom.debug_on,
    }
}

fn load(path: &Path) -> Result<RgbaImage, DemoError> {
    image::open(path)
        .map(|image| image.to_rgba8())
        .map_err(|source| DemoError::Load {
            path: path.to_path_buf(),
            source,
        })
}
