//! slean-trimmer: GPU slean edge trimming for Cuckatoo proof-of-work graphs
//!
//! # Overview
//!
//! A Cuckatoo graph has `2^edge_bits` edges whose endpoints are derived with
//! SipHash-2-4 from per-job keys. Trimming repeatedly removes edges whose
//! endpoint has no partner, leaving a small residual graph for a cycle finder.
//! This crate sizes, schedules and runs that trimming, two jobs in flight,
//! and hands every finished edge-survival bitmap to a consumer.
//!
//! # Quick Start
//!
//! ```no_run
//! use slean_trimmer::{
//!     Blake2bKeys, CpuBackend, JobPlan, JobTemplate, ResourceSizing, RoundScheduler,
//!     SessionContext, TrimmedGraph, TrimmingConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrimmingConfig::from_env()?;
//! let sizing = ResourceSizing::derive(&config)?;
//! let plan = JobPlan::build(&config, &sizing);
//! let mut scheduler = RoundScheduler::new(CpuBackend::new(sizing), Blake2bKeys, plan)?;
//!
//! let ctx = SessionContext::new(JobTemplate::default(), 0);
//! let mut consumer = |graph: TrimmedGraph<'_>| {
//!     println!("{} edges left", graph.surviving_edges());
//!     ctx.close();
//!     Ok::<(), anyhow::Error>(())
//! };
//! scheduler.run(&ctx, &mut consumer).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Sizing**: [`TrimmingConfig`] to [`ResourceSizing`], pure arithmetic
//! - **Plan**: [`JobPlan`], the stage table replayed for every job
//! - **Backends**: [`ComputeBackend`] with a software [`CpuBackend`] and, with
//!   the `gpu` feature, a wgpu backend
//! - **Scheduling**: [`RoundScheduler`] double-buffers jobs over two bitmaps

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod bitmap;
pub mod config;
pub mod cpu;
pub mod device;
pub mod error;
pub mod kernels;
pub mod plan;
pub mod reference;
pub mod scheduler;
pub mod session;
pub mod siphash;
pub mod sizing;

// wgpu backend (optional)
#[cfg(feature = "gpu")]
pub mod gpu;

// Re-export core types
pub use backend::{BitmapSlot, ComputeBackend};
pub use config::{RegimeThresholds, SlackFactors, TrimmingConfig};
pub use cpu::{CpuBackend, OverflowStats};
pub use device::{select_device, DeviceCandidate, DeviceClass, DeviceSelector, Selection};
pub use error::{Result, TrimError};
pub use kernels::{DeviceLimits, KernelId, WorkGroupSizes};
pub use plan::{JobPlan, Phase, Regime, Stage};
pub use scheduler::{JobState, RoundScheduler, RunSummary, TrimmedGraph, TrimmingConsumer};
pub use session::{Job, JobIdentity, JobTemplate, SessionContext};
pub use siphash::{Blake2bKeys, KeyDeriver, SipHashKeys};
pub use sizing::ResourceSizing;

#[cfg(feature = "gpu")]
pub use gpu::{GpuDevice, GpuMemoryLimits, WgpuBackend};
