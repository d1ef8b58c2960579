//! GPU slean trimming
//!
//! # Architecture
//!
//! - `device`: adapter enumeration, selection and device lifecycle
//! - `memory`: memory limits and source bucket placement
//! - `buffer`: buffers shared by both jobs in flight plus per-slot bitmaps
//! - `pipeline`: WGSL kernels specialized on the sizing, two-step build
//! - `backend`: [`WgpuBackend`], the [`ComputeBackend`](crate::ComputeBackend)
//!   the round scheduler drives
//!
//! # Feature Flag
//!
//! This module is only available with the `gpu` feature flag:
//! ```bash
//! cargo build --features gpu
//! ```

mod backend;
mod buffer;
mod device;
mod memory;
mod pipeline;

pub use backend::{WgpuBackend, WgpuSubmission};
pub use buffer::TrimmingBuffers;
pub use device::{kernel_limits, GpuDevice, GpuDeviceError};
pub use memory::{BucketSplit, GpuMemoryLimits};
pub use pipeline::{dispatch_dimensions, shader_source, StageParams, TrimmingPipelines};
