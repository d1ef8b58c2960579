//! Double-buffered round scheduler
//!
//! Keeps two jobs in flight on alternating survival bitmaps. While the host
//! waits for job N's bitmap and hands it to the consumer, job N+1 has already
//! been submitted to the same in-order queue, so the device never idles
//! between jobs. All shared buffers (buckets, counters, node bitmap) are
//! serialized by that queue; only the bitmaps are per job.
//!
//! The session's `closing` flag is polled after every submit and before every
//! wait. Once it is set the scheduler returns `Ok` immediately and in-flight
//! jobs are never handed to the consumer.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::{BitmapSlot, ComputeBackend};
use crate::bitmap::{bit_is_set, count_set_bits, set_bits};
use crate::error::{Result, TrimError};
use crate::plan::{JobPlan, Phase};
use crate::session::{Job, JobIdentity, SessionContext};
use crate::siphash::{KeyDeriver, SipHashKeys};

/// Lifecycle of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Keys are being derived
    Hashing,
    /// Round zero's scatter and mark passes are being recorded
    Scattering,
    /// Intermediate rounds are being recorded
    DegreeRounds,
    /// The last round's survival test is being recorded and submitted
    Finalizing,
    /// The bitmap is mapped for host reads
    ResultReady,
    /// The bitmap was passed to the consumer
    HandedOff,
    /// The slot is free for the next job
    Recycled,
}

impl JobState {
    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Hashing, Self::Scattering)
                | (Self::Scattering, Self::DegreeRounds | Self::Finalizing)
                | (Self::DegreeRounds, Self::Finalizing)
                | (Self::Finalizing, Self::ResultReady)
                | (Self::ResultReady, Self::HandedOff)
                | (Self::HandedOff, Self::Recycled)
        )
    }

    fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Scatter => Self::Scattering,
            Phase::DegreeRounds => Self::DegreeRounds,
            Phase::Finalize => Self::Finalizing,
        }
    }

    fn advance(&mut self, next: Self) -> Result<()> {
        if *self == next {
            return Ok(());
        }
        if !self.can_advance_to(next) {
            return Err(TrimError::InvalidState {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// A finished job as seen by the consumer
#[derive(Debug, Clone, Copy)]
pub struct TrimmedGraph<'a> {
    /// Survival bitmap, `NUMBER_OF_EDGES / 8` bytes, bit `i` = edge `i`
    pub edges_bitmap: &'a [u8],
    /// Keys the graph was generated with
    pub keys: SipHashKeys,
    /// Height, id and nonce of the job
    pub identity: JobIdentity,
}

impl TrimmedGraph<'_> {
    /// Whether `edge` survived trimming
    #[must_use]
    pub fn is_alive(&self, edge: u64) -> bool {
        bit_is_set(self.edges_bitmap, edge)
    }

    /// Number of surviving edges
    #[must_use]
    pub fn surviving_edges(&self) -> u64 {
        count_set_bits(self.edges_bitmap)
    }

    /// Indices of the surviving edges, ascending
    pub fn edges(&self) -> impl Iterator<Item = u64> + '_ {
        set_bits(self.edges_bitmap)
    }
}

/// Receives every trimmed graph, typically a cycle finder
///
/// The bitmap is only valid for the duration of the call; the slot is reused
/// two jobs later.
pub trait TrimmingConsumer {
    /// Handle one trimmed graph
    ///
    /// # Errors
    ///
    /// An error ends the mining loop.
    fn trimming_finished(&mut self, graph: TrimmedGraph<'_>) -> anyhow::Result<()>;
}

impl<F> TrimmingConsumer for F
where
    F: FnMut(TrimmedGraph<'_>) -> anyhow::Result<()>,
{
    fn trimming_finished(&mut self, graph: TrimmedGraph<'_>) -> anyhow::Result<()> {
        self(graph)
    }
}

/// Outcome of a [`RoundScheduler::run`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Jobs handed to the consumer
    pub jobs_completed: u64,
    /// Submitted jobs abandoned because the session closed
    pub jobs_abandoned: u64,
    /// Submit-to-map time of the last completed job
    pub last_trimming_time: Option<Duration>,
    /// Device execution time of the last completed job, if measured
    pub last_device_time: Option<Duration>,
    /// Graphs handed off with more edges than the plan's survival bound
    pub graphs_over_edge_bound: u64,
}

impl RunSummary {
    fn record(&mut self, finished: Finished) {
        self.jobs_completed += 1;
        self.last_trimming_time = Some(finished.wall);
        self.last_device_time = finished.device;
        self.graphs_over_edge_bound += u64::from(finished.over_edge_bound);
    }
}

#[derive(Debug, Clone, Copy)]
struct Finished {
    wall: Duration,
    device: Option<Duration>,
    over_edge_bound: bool,
}

fn trimming_time_message(wall: Duration, device: Option<Duration>) -> String {
    match device {
        Some(device) => format!(
            "Trimming time: {:.6} second(s) wall, {:.6} second(s) on device",
            wall.as_secs_f64(),
            device.as_secs_f64()
        ),
        None => format!(
            "Trimming time: {:.6} second(s) wall (device time unavailable)",
            wall.as_secs_f64()
        ),
    }
}

struct InFlight<S> {
    job: Job,
    slot: BitmapSlot,
    state: JobState,
    submission: S,
    submitted_at: Instant,
}

/// Drives a [`ComputeBackend`] through the stage table, job after job
pub struct RoundScheduler<B, K> {
    backend: B,
    deriver: K,
    plan: JobPlan,
}

impl<B, K> RoundScheduler<B, K>
where
    B: ComputeBackend,
    K: KeyDeriver,
{
    /// Bind `plan` to `backend`
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot upload the plan's dispatch arguments.
    pub fn new(mut backend: B, deriver: K, plan: JobPlan) -> Result<Self> {
        backend.prepare(&plan).map_err(|e| {
            error!("Preparing the trimming plan on {} failed: {e}", backend.name());
            e
        })?;
        Ok(Self {
            backend,
            deriver,
            plan,
        })
    }

    /// The backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Give the backend back
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// The stage table replayed for every job
    pub fn plan(&self) -> &JobPlan {
        &self.plan
    }

    /// Mine until the session closes or something fails
    ///
    /// Returns `Ok` when `closing` is observed, whether or not jobs are still
    /// in flight.
    ///
    /// # Errors
    ///
    /// Any backend or consumer failure ends the loop and is returned.
    pub async fn run(
        &mut self,
        ctx: &SessionContext,
        consumer: &mut impl TrimmingConsumer,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        if ctx.is_closing() {
            return Ok(summary);
        }

        let mut current = self.launch(ctx, BitmapSlot::One)?;
        if ctx.is_closing() {
            summary.jobs_abandoned = 1;
            return Ok(summary);
        }

        loop {
            let next = self.launch(ctx, current.slot.other())?;
            if ctx.is_closing() {
                summary.jobs_abandoned = 2;
                return Ok(summary);
            }

            let finished = self.finish(current, ctx, consumer).await?;
            summary.record(finished);
            if ctx.is_closing() {
                summary.jobs_abandoned = 1;
                return Ok(summary);
            }
            current = next;
        }
    }

    /// Trim a single job outside the mining loop and return its bitmap
    ///
    /// # Errors
    ///
    /// Fails on any backend error.
    pub async fn trim_job(&mut self, job: &Job, slot: BitmapSlot) -> Result<Vec<u8>> {
        let in_flight = self.record_and_submit(*job, slot)?;
        self.backend.wait(in_flight.submission).await?;
        self.backend.read_bitmap(slot, <[u8]>::to_vec)
    }

    fn launch(&mut self, ctx: &SessionContext, slot: BitmapSlot) -> Result<InFlight<B::Submission>> {
        let job = ctx.next_job(&self.deriver);
        self.record_and_submit(job, slot)
    }

    fn record_and_submit(&mut self, job: Job, slot: BitmapSlot) -> Result<InFlight<B::Submission>> {
        let mut state = JobState::Hashing;
        let name = self.backend.name().to_string();
        let fail = |e: TrimError| {
            error!("Running program on {name} failed: {e}");
            e
        };

        self.backend.begin_job(slot, &job.keys).map_err(fail)?;
        for (phase, stage) in self.plan.stages() {
            state.advance(JobState::for_phase(*phase))?;
            self.backend.record(stage).map_err(fail)?;
        }
        let submission = self.backend.submit().map_err(fail)?;
        debug!(
            "Submitted job nonce {} to bitmap {slot:?} ({} dispatches)",
            job.identity.nonce,
            self.plan.dispatch_count()
        );
        Ok(InFlight {
            job,
            slot,
            state,
            submission,
            submitted_at: Instant::now(),
        })
    }

    async fn finish(
        &mut self,
        mut in_flight: InFlight<B::Submission>,
        ctx: &SessionContext,
        consumer: &mut impl TrimmingConsumer,
    ) -> Result<Finished> {
        let device = self.backend.wait(in_flight.submission).await.map_err(|e| {
            error!("Getting result from {} failed: {e}", self.backend.name());
            e
        })?;
        in_flight.state.advance(JobState::ResultReady)?;
        let wall = in_flight.submitted_at.elapsed();
        info!("{}", trimming_time_message(wall, device));

        let Job { identity, keys } = in_flight.job;
        let edge_bound = self.plan.max_edges_after_trimming();
        let (handed, surviving) = self.backend.read_bitmap(in_flight.slot, |edges_bitmap| {
            let graph = TrimmedGraph {
                edges_bitmap,
                keys,
                identity,
            };
            let surviving = graph.surviving_edges();
            (consumer.trimming_finished(graph), surviving)
        })?;
        in_flight.state.advance(JobState::HandedOff)?;
        let over_edge_bound = surviving > edge_bound;
        if over_edge_bound {
            warn!(
                "Nonce {} kept {surviving} edges, more than the expected {edge_bound}",
                identity.nonce
            );
        }
        handed.map_err(|e| {
            error!("Trimming consumer failed for nonce {}: {e:#}", identity.nonce);
            TrimError::Consumer(e)
        })?;

        if let Some(interval) = ctx.record_graph_processed() {
            debug!(
                "Mining rate: {:.3} graph(s) per second",
                1.0 / interval.as_secs_f64().max(f64::EPSILON)
            );
        }
        in_flight.state.advance(JobState::Recycled)?;
        Ok(Finished {
            wall,
            device,
            over_edge_bound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use JobState::*;
        assert!(Hashing.can_advance_to(Scattering));
        assert!(Scattering.can_advance_to(Finalizing));
        assert!(Scattering.can_advance_to(DegreeRounds));
        assert!(HandedOff.can_advance_to(Recycled));
        assert!(!Hashing.can_advance_to(ResultReady));
        assert!(!Finalizing.can_advance_to(DegreeRounds));
        assert!(!Recycled.can_advance_to(Hashing));
    }

    #[test]
    fn test_advance_rejects_skips() {
        let mut state = JobState::Hashing;
        state.advance(JobState::Scattering).unwrap();
        state.advance(JobState::Scattering).unwrap();
        let err = state.advance(JobState::HandedOff).unwrap_err();
        assert!(matches!(
            err,
            TrimError::InvalidState {
                from: JobState::Scattering,
                to: JobState::HandedOff
            }
        ));
    }

    #[test]
    fn test_trimmed_graph_accessors() {
        let bitmap = [0b0000_0101u8, 0, 0, 0x80];
        let graph = TrimmedGraph {
            edges_bitmap: &bitmap,
            keys: SipHashKeys::default(),
            identity: JobIdentity {
                height: 1,
                id: 2,
                nonce: 3,
            },
        };
        assert!(graph.is_alive(0));
        assert!(!graph.is_alive(1));
        assert!(graph.is_alive(31));
        assert_eq!(graph.surviving_edges(), 3);
        assert_eq!(graph.edges().collect::<Vec<_>>(), vec![0, 2, 31]);
    }

    #[test]
    fn test_trimming_time_message_names_missing_device_time() {
        let wall = Duration::from_millis(1500);
        assert_eq!(
            trimming_time_message(wall, Some(Duration::from_millis(250))),
            "Trimming time: 1.500000 second(s) wall, 0.250000 second(s) on device"
        );
        assert_eq!(
            trimming_time_message(wall, None),
            "Trimming time: 1.500000 second(s) wall (device time unavailable)"
        );
    }

    #[test]
    fn test_summary_records_finished_jobs() {
        let mut summary = RunSummary::default();
        summary.record(Finished {
            wall: Duration::from_secs(2),
            device: Some(Duration::from_secs(1)),
            over_edge_bound: true,
        });
        summary.record(Finished {
            wall: Duration::from_secs(3),
            device: None,
            over_edge_bound: false,
        });
        assert_eq!(summary.jobs_completed, 2);
        assert_eq!(summary.last_trimming_time, Some(Duration::from_secs(3)));
        assert_eq!(summary.last_device_time, None);
        assert_eq!(summary.graphs_over_edge_bound, 1);
    }
}
