//! Compute backend seam
//!
//! The round scheduler is written once against [`ComputeBackend`]. A backend
//! owns the device buffers and executes the stage table of a [`JobPlan`]
//! against them, in order, on a single in-order queue.

use std::time::Duration;

use crate::error::Result;
use crate::plan::{JobPlan, Stage};
use crate::siphash::SipHashKeys;

/// One of the two edge-survival bitmaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitmapSlot {
    /// Edges bitmap one
    One,
    /// Edges bitmap two
    Two,
}

impl BitmapSlot {
    /// Both slots
    pub const BOTH: [Self; 2] = [Self::One, Self::Two];

    /// The slot the next job uses
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::One => Self::Two,
            Self::Two => Self::One,
        }
    }

    /// Zero-based index
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }
}

/// A device that can run the trimming stage table
///
/// Call order per job: [`begin_job`](Self::begin_job), [`record`](Self::record)
/// for every stage, [`submit`](Self::submit), later [`wait`](Self::wait) and
/// [`read_bitmap`](Self::read_bitmap). Two jobs may be submitted before the
/// first is waited on, provided they use different slots.
#[allow(async_fn_in_trait)]
pub trait ComputeBackend {
    /// Handle to a submitted job
    type Submission;

    /// Human-readable device name
    fn name(&self) -> &str;

    /// Bind the invariant per-dispatch arguments of `plan`
    ///
    /// # Errors
    ///
    /// Fails if the arguments cannot be uploaded to the device.
    fn prepare(&mut self, plan: &JobPlan) -> Result<()>;

    /// Start recording a job writing `slot` under `keys`
    ///
    /// # Errors
    ///
    /// Fails if a job is already being recorded or the slot is still mapped.
    fn begin_job(&mut self, slot: BitmapSlot, keys: &SipHashKeys) -> Result<()>;

    /// Record one stage of the current job
    ///
    /// # Errors
    ///
    /// Fails if no job is being recorded or the stage cannot be encoded.
    fn record(&mut self, stage: &Stage) -> Result<()>;

    /// Submit the recorded job and request its bitmap for host reads
    ///
    /// # Errors
    ///
    /// Fails if no job is being recorded or the submission is rejected.
    fn submit(&mut self) -> Result<Self::Submission>;

    /// Block until the submitted job finished and its bitmap is mapped
    ///
    /// Returns the time the device spent executing the job, or `None` when
    /// the device cannot measure it.
    ///
    /// # Errors
    ///
    /// Fails if the device reported an error or the map failed.
    async fn wait(&mut self, submission: Self::Submission) -> Result<Option<Duration>>;

    /// Read the mapped bitmap of `slot`, then release the mapping
    ///
    /// The slice holds `NUMBER_OF_EDGES / 8` bytes.
    ///
    /// # Errors
    ///
    /// Fails if `slot` has not been waited on.
    fn read_bitmap<R>(&mut self, slot: BitmapSlot, read: impl FnOnce(&[u8]) -> R) -> Result<R>;
}
