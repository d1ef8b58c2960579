//! GPU buffers of the trimming pipeline
//!
//! Manages GPU-side storage of:
//! - Source buckets (one or two buffers), destination buckets
//! - Both fill counter arrays and the node bitmap
//! - Per slot: SipHash keys, edge-survival bitmap and its readback copy
//!
//! Everything except the per-slot buffers is shared by the two jobs in flight;
//! the in-order queue serializes their use.

use tracing::{debug, error};

use super::memory::{BucketSplit, GpuMemoryLimits};
use super::GpuDevice;
use crate::backend::BitmapSlot;
use crate::error::{Result, TrimError};
use crate::plan::ClearTarget;
use crate::sizing::ResourceSizing;

/// Bytes of the SipHash keys uniform
pub const KEYS_BYTES: u64 = 32;

/// Device buffers for one trimming session
#[derive(Debug)]
pub struct TrimmingBuffers {
    /// Source buckets, first and second part
    pub buckets_one: [wgpu::Buffer; 2],

    /// Source bucket fill counters (size: `buckets_one`)
    pub counts_one: wgpu::Buffer,

    /// Destination buckets
    pub buckets_two: wgpu::Buffer,

    /// Destination bucket fill counters (size: `buckets_two`)
    pub counts_two: wgpu::Buffer,

    /// Node bitmap (size: `NUMBER_OF_EDGES / 8`)
    pub nodes: wgpu::Buffer,

    /// SipHash keys per slot
    pub keys: [wgpu::Buffer; 2],

    /// Edge-survival bitmap per slot
    pub survival: [wgpu::Buffer; 2],

    /// Host-mappable copy of each survival bitmap
    pub readback: [wgpu::Buffer; 2],

    /// Placement of the source buckets
    pub split: BucketSplit,
}

impl TrimmingBuffers {
    /// Allocate every buffer for `sizing`
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::Allocation`] if a buffer exceeds the binding limit
    /// or the device runs out of memory.
    pub async fn allocate(
        device: &GpuDevice,
        sizing: &ResourceSizing,
        limits: &GpuMemoryLimits,
    ) -> Result<Self> {
        if !limits.fits(sizing) {
            return Err(allocation_failed(format!(
                "insufficient device memory: {} bytes required, about {} available",
                sizing.required_bytes(),
                limits.total_vram
            )));
        }
        let split = BucketSplit::plan(sizing, limits).map_err(|e| {
            error!("Allocating memory on the GPU failed: {e}");
            e
        })?;
        limits.check_binding("destination buckets", sizing.buckets_two_words() * 4)?;
        limits.check_binding("edge bitmap", sizing.full_bitmap_bytes)?;

        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let bitmap = storage | wgpu::BufferUsages::COPY_SRC;
        let readback = wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
        let keys = wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST;
        let [first_bytes, second_bytes] = split.buffer_bytes();

        device
            .device()
            .push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffers = Self {
            buckets_one: [
                device.create_buffer("Buckets One A", first_bytes, storage),
                device.create_buffer("Buckets One B", second_bytes, storage),
            ],
            counts_one: device.create_buffer("Counts One", sizing.buckets_one * 4, storage),
            buckets_two: device.create_buffer(
                "Buckets Two",
                sizing.buckets_two_words() * 4,
                storage,
            ),
            counts_two: device.create_buffer("Counts Two", sizing.buckets_two * 4, storage),
            nodes: device.create_buffer("Nodes Bitmap", sizing.full_bitmap_bytes, storage),
            keys: [
                device.create_buffer("Keys One", KEYS_BYTES, keys),
                device.create_buffer("Keys Two", KEYS_BYTES, keys),
            ],
            survival: [
                device.create_buffer("Edges Bitmap One", sizing.full_bitmap_bytes, bitmap),
                device.create_buffer("Edges Bitmap Two", sizing.full_bitmap_bytes, bitmap),
            ],
            readback: [
                device.create_buffer("Edges Readback One", sizing.full_bitmap_bytes, readback),
                device.create_buffer("Edges Readback Two", sizing.full_bitmap_bytes, readback),
            ],
            split,
        };
        if let Some(err) = device.device().pop_error_scope().await {
            return Err(allocation_failed(format!("insufficient device memory: {err}")));
        }

        debug!(
            "Allocated {} bytes of trimming buffers (source buckets split: {})",
            sizing.required_bytes(),
            split.is_split()
        );
        Ok(buffers)
    }

    /// Buffer reset by a clear stage of a job on `slot`
    #[must_use]
    pub fn clear_target(&self, target: ClearTarget, slot: BitmapSlot) -> &wgpu::Buffer {
        match target {
            ClearTarget::CountsOne => &self.counts_one,
            ClearTarget::CountsTwo => &self.counts_two,
            ClearTarget::NodeBitmap => &self.nodes,
            ClearTarget::SurvivalBitmap => &self.survival[slot.index()],
        }
    }

    /// Bind group 0 for jobs on `slot`
    #[must_use]
    pub fn slot_bind_group(
        &self,
        device: &GpuDevice,
        layout: &wgpu::BindGroupLayout,
        slot: BitmapSlot,
    ) -> wgpu::BindGroup {
        let i = slot.index();
        device
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(match slot {
                    BitmapSlot::One => "Slean Slot One Bind Group",
                    BitmapSlot::Two => "Slean Slot Two Bind Group",
                }),
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.buckets_one[0].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.buckets_one[1].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: self.counts_one.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: self.buckets_two.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: self.counts_two.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: self.nodes.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: self.survival[i].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 7,
                        resource: self.keys[i].as_entire_binding(),
                    },
                ],
            })
    }
}

fn allocation_failed(message: String) -> TrimError {
    error!("Allocating memory on the GPU failed: {message}");
    TrimError::Allocation(message)
}
