//! Pool of scratch images reused across bloom frames.
//!
//! Instead of creating and destroying render targets every frame, the
//! [`ScratchPool`] keeps released images in buckets keyed by size and format.
//! A pyramid built for the same source resolution next frame gets exactly the
//! images it released last frame, with no new driver allocations.

use std::collections::HashMap;

use crate::backend::{ScratchDesc, ScratchFormat};
use crate::error::BackendError;
use crate::mip_plan::Extent;

/// Bucket key: images are only interchangeable when size and format match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchKey {
    pub extent: Extent,
    pub format: ScratchFormat,
}

impl ScratchKey {
    pub fn byte_size(&self) -> u64 {
        self.extent.texel_count() * u64::from(self.format.bytes_per_pixel())
    }
}

impl From<&ScratchDesc> for ScratchKey {
    fn from(desc: &ScratchDesc) -> Self {
        Self {
            extent: desc.extent,
            format: desc.format,
        }
    }
}

/// A pool of backend images bucketed by [`ScratchKey`].
///
/// Tracks total allocated and in-use memory, optionally against a budget.
pub struct ScratchPool<T> {
    free: HashMap<ScratchKey, Vec<T>>,
    /// Total bytes currently allocated (in-use + pooled).
    total_allocated: u64,
    /// Total bytes currently lent out.
    in_use: u64,
    budget: Option<u64>,
}

impl<T> ScratchPool<T> {
    /// Create a new empty pool without a memory budget.
    pub fn new() -> Self {
        Self {
            free: HashMap::new(),
            total_allocated: 0,
            in_use: 0,
            budget: None,
        }
    }

    /// Limit the bytes this pool may allocate. `None` removes the limit.
    pub fn with_budget(mut self, budget: Option<u64>) -> Self {
        self.budget = budget;
        self
    }

    pub fn set_budget(&mut self, budget: Option<u64>) {
        self.budget = budget;
    }

    /// Acquire an image for `key`.
    ///
    /// Returns a pooled image if one is free, or calls `create` when the budget allows.
    pub fn acquire(
        &mut self,
        key: ScratchKey,
        create: impl FnOnce() -> T,
    ) -> Result<T, BackendError> {
        if key.extent.is_empty() {
            return Err(BackendError::ZeroExtent {
                width: key.extent.width,
                height: key.extent.height,
            });
        }

        let size = key.byte_size();

        if let Some(image) = self.free.get_mut(&key).and_then(Vec::pop) {
            self.in_use += size;
            return Ok(image);
        }

        if let Some(budget) = self.budget {
            let available = budget.saturating_sub(self.total_allocated);
            if size > available {
                // Pooled images of other sizes can be dropped to make room.
                self.trim();
                let available = budget.saturating_sub(self.total_allocated);
                if size > available {
                    return Err(BackendError::OutOfMemory {
                        requested: size,
                        available,
                    });
                }
            }
        }

        let image = create();
        self.total_allocated += size;
        self.in_use += size;
        Ok(image)
    }

    /// Return an image to the pool for reuse.
    pub fn release(&mut self, key: ScratchKey, image: T) {
        self.in_use = self.in_use.saturating_sub(key.byte_size());
        self.free.entry(key).or_default().push(image);
    }

    /// Drop every free image.
    pub fn trim(&mut self) {
        let freed: u64 = self
            .free
            .iter()
            .map(|(key, images)| key.byte_size() * images.len() as u64)
            .sum();
        self.free.clear();
        self.total_allocated = self.total_allocated.saturating_sub(freed);
        if freed > 0 {
            log::debug!("Trimmed {freed} bytes of pooled scratch images");
        }
    }

    /// Memory lent out to the current frame.
    pub fn memory_in_use(&self) -> u64 {
        self.in_use
    }

    /// Total memory allocated (including pooled free images).
    pub fn memory_allocated(&self) -> u64 {
        self.total_allocated
    }

    /// Number of free images across all buckets.
    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}

impl<T> Default for ScratchPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
