use std::path::PathBuf;

use glint_render::{BackendError, BloomError, FrameReport};

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("failed to load {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to save {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Bloom(#[from] BloomError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("frame {frame} leaked scratch buffers: {report:?}")]
    Unbalanced { frame: u32, report: FrameReport },
}
