//! GPU memory limits and source bucket placement
//!
//! wgpu reports no VRAM size, so total memory is estimated from the buffer
//! size limit. The binding limit decides whether the source bucket array fits
//! one buffer or has to be split in two.

use super::GpuDevice;
use crate::error::{Result, TrimError};
use crate::sizing::ResourceSizing;

/// GPU memory limits relevant to trimming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemoryLimits {
    /// Total VRAM estimate (bytes)
    pub total_vram: u64,

    /// Largest single buffer (bytes)
    pub max_buffer_size: u64,

    /// Largest storage binding (bytes)
    pub max_binding_size: u64,
}

impl GpuMemoryLimits {
    /// Detect limits of an opened device
    #[must_use]
    pub fn detect(device: &GpuDevice) -> Self {
        Self::from_limits(&device.device().limits())
    }

    /// Limits implied by a wgpu limit set
    #[must_use]
    pub fn from_limits(limits: &wgpu::Limits) -> Self {
        Self {
            // Most GPUs have max_buffer_size = VRAM size or similar
            total_vram: limits.max_buffer_size,
            max_buffer_size: limits.max_buffer_size,
            max_binding_size: u64::from(limits.max_storage_buffer_binding_size),
        }
    }

    /// Largest buffer a kernel can bind
    #[must_use]
    pub fn largest_allocation(&self) -> u64 {
        self.max_buffer_size.min(self.max_binding_size)
    }

    /// Check if every trimming buffer fits together
    #[must_use]
    pub fn fits(&self, sizing: &ResourceSizing) -> bool {
        sizing.required_bytes() <= self.total_vram
    }

    /// Check that `bytes` can be a single binding
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::Allocation`] naming `what` when it does not.
    pub fn check_binding(&self, what: &str, bytes: u64) -> Result<()> {
        if bytes > self.largest_allocation() {
            return Err(TrimError::Allocation(format!(
                "insufficient device memory: {what} needs {bytes} bytes, largest binding is {}",
                self.largest_allocation()
            )));
        }
        Ok(())
    }
}

/// Placement of the source bucket array over one or two buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSplit {
    /// Words in the first buffer
    pub first_words: u64,
    /// Words in the second buffer (zero when not split)
    pub second_words: u64,
}

impl BucketSplit {
    /// Place the source buckets under `limits`
    ///
    /// When one buffer cannot hold them, the first buffer holds
    /// `ceil(after_round_stride * buckets / initial_stride)` buckets so that
    /// every round after round zero stays inside it.
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::Allocation`] when either half still exceeds the
    /// binding limit.
    pub fn plan(sizing: &ResourceSizing, limits: &GpuMemoryLimits) -> Result<Self> {
        let total_words = sizing.buckets_one_words();
        if total_words * 4 <= limits.largest_allocation() {
            return Ok(Self {
                first_words: total_words,
                second_words: 0,
            });
        }

        let first_buckets = (sizing.after_round_max_per_bucket * sizing.buckets_one)
            .div_ceil(sizing.initial_max_per_bucket);
        let first_words = first_buckets * sizing.initial_max_per_bucket;
        let split = Self {
            first_words,
            second_words: total_words - first_words,
        };
        limits.check_binding("first source bucket buffer", split.first_words * 4)?;
        limits.check_binding("second source bucket buffer", split.second_words * 4)?;
        Ok(split)
    }

    /// Whether the buckets span two buffers
    #[must_use]
    pub fn is_split(&self) -> bool {
        self.second_words > 0
    }

    /// Byte sizes of both buffers; an unused second buffer still gets one word
    #[must_use]
    pub fn buffer_bytes(&self) -> [u64; 2] {
        [self.first_words * 4, self.second_words.max(1) * 4]
    }
}
