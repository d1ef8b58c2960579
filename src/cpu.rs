//! Software compute backend
//!
//! Runs every kernel of the stage table on the host with the same buffers,
//! bucket capacities and overflow behavior as the device kernels. Buckets,
//! counters and the node bitmap are shared between the two slots exactly as on
//! the device, so cross-job state leaks would show up here too.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::backend::{BitmapSlot, ComputeBackend};
use crate::bitmap::Bitmap;
use crate::error::{Result, TrimError};
use crate::kernels::KernelId;
use crate::plan::{ClearTarget, DispatchArgs, EdgeSelection, FilterMode, JobPlan, Stage};
use crate::siphash::SipHashKeys;
use crate::sizing::ResourceSizing;

/// Completed-job handle of the software backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSubmission {
    slot: BitmapSlot,
    busy: Duration,
}

/// Bucket occupancy accumulated over every scatter since construction
///
/// Fill counts are requested positions, so a fill above the bucket's
/// capacity means edges were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverflowStats {
    /// Edges appended past a bucket's capacity and dropped
    pub dropped_edges: u64,
    /// Largest source-bucket fill of a full sweep (round 0)
    pub max_fill_initial: u64,
    /// Largest source-bucket fill of a later source-regime round
    pub max_fill_after_round: u64,
    /// Largest destination-bucket fill
    pub max_fill_destination: u64,
}

impl OverflowStats {
    fn record_fill(&mut self, args: &DispatchArgs, destination: bool, fill: u64) {
        let max = if destination {
            &mut self.max_fill_destination
        } else if args.selection == EdgeSelection::All {
            &mut self.max_fill_initial
        } else {
            &mut self.max_fill_after_round
        };
        *max = (*max).max(fill);
    }
}

/// Host implementation of [`ComputeBackend`]
#[derive(Debug)]
pub struct CpuBackend {
    sizing: ResourceSizing,
    buckets_one: Vec<u32>,
    counts_one: Vec<u32>,
    buckets_two: Vec<u32>,
    counts_two: Vec<u32>,
    nodes: Bitmap,
    survival: [Bitmap; 2],
    recording: Option<(BitmapSlot, SipHashKeys)>,
    busy: Duration,
    ready: [bool; 2],
    stats: OverflowStats,
    dispatches: u64,
}

impl CpuBackend {
    /// Allocate host buffers for `sizing`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(sizing: ResourceSizing) -> Self {
        Self {
            buckets_one: vec![0; sizing.buckets_one_words() as usize],
            counts_one: vec![0; sizing.buckets_one as usize],
            buckets_two: vec![0; sizing.buckets_two_words() as usize],
            counts_two: vec![0; sizing.buckets_two as usize],
            nodes: Bitmap::new(sizing.number_of_edges),
            survival: [
                Bitmap::new(sizing.number_of_edges),
                Bitmap::new(sizing.number_of_edges),
            ],
            sizing,
            recording: None,
            busy: Duration::ZERO,
            ready: [false; 2],
            stats: OverflowStats::default(),
            dispatches: 0,
        }
    }

    /// Overflow statistics accumulated since construction
    #[must_use]
    pub fn overflow_stats(&self) -> OverflowStats {
        self.stats
    }

    /// Kernel launches executed since construction
    #[must_use]
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    fn edge_mask(&self) -> u64 {
        self.sizing.number_of_edges - 1
    }

    fn scatter(&mut self, keys: &SipHashKeys, slot: BitmapSlot, args: &DispatchArgs, destination: bool) {
        let mask = self.edge_mask();
        let (sort_bits, stride) = if destination {
            (self.sizing.sort_bits_two, self.sizing.after_round_max_per_remaining_bucket)
        } else {
            (self.sizing.sort_bits_one, args.stride)
        };
        let survival = &self.survival[slot.index()];
        let (buckets, counts) = if destination {
            (&mut self.buckets_two, &mut self.counts_two)
        } else {
            (&mut self.buckets_one, &mut self.counts_one)
        };

        for edge in args.edge_offset..args.edge_offset + args.edge_count {
            if args.selection == EdgeSelection::Alive && !survival.get(edge) {
                continue;
            }
            let bucket = keys.node(edge, args.side, mask) >> sort_bits;
            let fill = &mut counts[to_index(bucket)];
            let position = u64::from(*fill);
            *fill = fill.wrapping_add(1);
            self.stats.record_fill(args, destination, position + 1);
            if position < stride {
                buckets[to_index(bucket * stride + position)] = to_word(edge);
            } else {
                self.stats.dropped_edges += 1;
            }
        }
    }

    fn bucket_edges(&self, destination: bool, stride: u64) -> Vec<u64> {
        let (buckets, counts) = if destination {
            (&self.buckets_two, &self.counts_two)
        } else {
            (&self.buckets_one, &self.counts_one)
        };
        let mut edges = Vec::new();
        for (bucket, &fill) in counts.iter().enumerate() {
            let start = bucket as u64 * stride;
            let filled = u64::from(fill).min(stride);
            edges.extend(
                buckets[to_index(start)..to_index(start + filled)]
                    .iter()
                    .map(|&e| u64::from(e)),
            );
        }
        edges
    }

    fn mark(&mut self, keys: &SipHashKeys, args: &DispatchArgs, destination: bool) {
        let mask = self.edge_mask();
        for edge in self.bucket_edges(destination, self.stride_of(args, destination)) {
            self.nodes.set(keys.node(edge, args.side, mask));
        }
    }

    fn filter(&mut self, keys: &SipHashKeys, slot: BitmapSlot, args: &DispatchArgs, destination: bool) {
        let mask = self.edge_mask();
        for edge in self.bucket_edges(destination, self.stride_of(args, destination)) {
            let has_partner = self.nodes.get(keys.node(edge, args.side, mask) ^ 1);
            let survival = &mut self.survival[slot.index()];
            match (args.filter, has_partner) {
                (FilterMode::SetSurvivors, true) => survival.set(edge),
                (FilterMode::ClearTrimmed, false) => survival.unset(edge),
                _ => {}
            }
        }
    }

    fn stride_of(&self, args: &DispatchArgs, destination: bool) -> u64 {
        if destination {
            self.sizing.after_round_max_per_remaining_bucket
        } else {
            args.stride
        }
    }
}

fn to_index(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

#[allow(clippy::cast_possible_truncation)]
fn to_word(edge: u64) -> u32 {
    edge as u32
}

impl ComputeBackend for CpuBackend {
    type Submission = CpuSubmission;

    fn name(&self) -> &str {
        "CPU"
    }

    fn prepare(&mut self, plan: &JobPlan) -> Result<()> {
        debug!("CPU backend prepared {} dispatches per job", plan.dispatch_count());
        Ok(())
    }

    fn begin_job(&mut self, slot: BitmapSlot, keys: &SipHashKeys) -> Result<()> {
        if self.recording.is_some() {
            return Err(TrimError::Dispatch("a job is already being recorded".to_string()));
        }
        self.ready[slot.index()] = false;
        self.recording = Some((slot, *keys));
        self.busy = Duration::ZERO;
        Ok(())
    }

    fn record(&mut self, stage: &Stage) -> Result<()> {
        let (slot, keys) = self
            .recording
            .ok_or_else(|| TrimError::Dispatch("no job is being recorded".to_string()))?;
        match stage {
            Stage::Clear(ClearTarget::CountsOne) => self.counts_one.fill(0),
            Stage::Clear(ClearTarget::CountsTwo) => self.counts_two.fill(0),
            Stage::Clear(ClearTarget::NodeBitmap) => self.nodes.clear(),
            Stage::Clear(ClearTarget::SurvivalBitmap) => self.survival[slot.index()].clear(),
            Stage::Dispatch(dispatch) => {
                let started = Instant::now();
                self.dispatches += 1;
                let args = &dispatch.args;
                match dispatch.kernel {
                    KernelId::ScatterSource => self.scatter(&keys, slot, args, false),
                    KernelId::ScatterDestination => self.scatter(&keys, slot, args, true),
                    KernelId::MarkSource => self.mark(&keys, args, false),
                    KernelId::MarkDestination => self.mark(&keys, args, true),
                    KernelId::FilterSource => self.filter(&keys, slot, args, false),
                    KernelId::FilterDestination => self.filter(&keys, slot, args, true),
                }
                self.busy += started.elapsed();
            }
        }
        Ok(())
    }

    fn submit(&mut self) -> Result<CpuSubmission> {
        let (slot, _) = self
            .recording
            .take()
            .ok_or_else(|| TrimError::Dispatch("no job is being recorded".to_string()))?;
        Ok(CpuSubmission {
            slot,
            busy: self.busy,
        })
    }

    // kernels already ran while recording, their time is the job's device time
    async fn wait(&mut self, submission: CpuSubmission) -> Result<Option<Duration>> {
        self.ready[submission.slot.index()] = true;
        Ok(Some(submission.busy))
    }

    fn read_bitmap<R>(&mut self, slot: BitmapSlot, read: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if !self.ready[slot.index()] {
            return Err(TrimError::Map(format!("bitmap {slot:?} is not ready")));
        }
        let bytes = self.survival[slot.index()].to_bytes();
        self.ready[slot.index()] = false;
        Ok(read(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrimmingConfig;
    use crate::reference::trim_edges;

    fn backend(edge_bits: u32, parts: u32, rounds: u32) -> (CpuBackend, JobPlan) {
        let config = TrimmingConfig::new(edge_bits)
            .with_parts(parts)
            .with_local_ram_kb(32)
            .with_trimming_rounds(rounds);
        let sizing = ResourceSizing::derive(&config).unwrap();
        (CpuBackend::new(sizing), JobPlan::build(&config, &sizing))
    }

    async fn run(
        backend: &mut CpuBackend,
        plan: &JobPlan,
        slot: BitmapSlot,
        keys: SipHashKeys,
    ) -> Vec<u8> {
        backend.begin_job(slot, &keys).unwrap();
        for (_, stage) in plan.stages() {
            backend.record(stage).unwrap();
        }
        let submission = backend.submit().unwrap();
        backend.wait(submission).await.unwrap();
        backend.read_bitmap(slot, <[u8]>::to_vec).unwrap()
    }

    #[tokio::test]
    async fn test_matches_reference_for_source_rounds() {
        let (mut cpu, plan) = backend(12, 2, 2);
        let keys = SipHashKeys([3, 1, 4, 1]);
        let bitmap = run(&mut cpu, &plan, BitmapSlot::One, keys).await;
        assert_eq!(bitmap, trim_edges(&keys, 12, 2).to_bytes());
        assert_eq!(cpu.overflow_stats().dropped_edges, 0);
    }

    #[tokio::test]
    async fn test_matches_reference_through_destination_rounds() {
        let (mut cpu, plan) = backend(14, 4, 8);
        let keys = SipHashKeys([2, 7, 1, 8]);
        let bitmap = run(&mut cpu, &plan, BitmapSlot::Two, keys).await;
        assert_eq!(cpu.overflow_stats().dropped_edges, 0);
        assert_eq!(bitmap, trim_edges(&keys, 14, 8).to_bytes());
    }

    #[tokio::test]
    async fn test_read_requires_wait() {
        let (mut cpu, plan) = backend(10, 2, 1);
        cpu.begin_job(BitmapSlot::One, &SipHashKeys::default()).unwrap();
        for (_, stage) in plan.stages() {
            cpu.record(stage).unwrap();
        }
        let submission = cpu.submit().unwrap();
        assert!(cpu.read_bitmap(BitmapSlot::One, |b| b.len()).is_err());
        cpu.wait(submission).await.unwrap();
        assert_eq!(cpu.read_bitmap(BitmapSlot::One, |b| b.len()).unwrap(), 128);
        // released after one read
        assert!(cpu.read_bitmap(BitmapSlot::One, |b| b.len()).is_err());
    }

    #[test]
    fn test_record_without_job_fails() {
        let (mut cpu, _) = backend(10, 2, 1);
        let err = cpu.record(&Stage::Clear(ClearTarget::NodeBitmap)).unwrap_err();
        assert!(matches!(err, TrimError::Dispatch(_)));
        assert!(cpu.submit().is_err());
    }

    #[test]
    fn test_overflow_drops_are_counted() {
        let (mut cpu, _) = backend(10, 2, 1);
        let keys = SipHashKeys::default();
        cpu.begin_job(BitmapSlot::One, &keys).unwrap();
        let args = DispatchArgs {
            edge_offset: 0,
            edge_count: 512,
            side: 0,
            selection: EdgeSelection::All,
            filter: FilterMode::SetSurvivors,
            stride: 100,
        };
        cpu.scatter(&keys, BitmapSlot::One, &args, false);
        let stats = cpu.overflow_stats();
        assert_eq!(stats.max_fill_initial, 512);
        assert_eq!(stats.max_fill_after_round, 0);
        assert_eq!(stats.dropped_edges, 412);
    }

    #[test]
    fn test_fills_are_kept_per_regime() {
        let (mut cpu, _) = backend(10, 2, 1);
        let keys = SipHashKeys::default();
        cpu.begin_job(BitmapSlot::One, &keys).unwrap();
        let sweep = DispatchArgs {
            edge_offset: 0,
            edge_count: 512,
            side: 0,
            selection: EdgeSelection::All,
            filter: FilterMode::SetSurvivors,
            stride: cpu.sizing.initial_max_per_bucket,
        };
        cpu.scatter(&keys, BitmapSlot::One, &sweep, false);
        let initial = cpu.overflow_stats().max_fill_initial;
        assert!(initial > 0);

        // nothing is alive yet, so later rounds fill nothing
        let later = DispatchArgs {
            selection: EdgeSelection::Alive,
            filter: FilterMode::ClearTrimmed,
            ..sweep
        };
        cpu.scatter(&keys, BitmapSlot::One, &later, false);
        assert_eq!(cpu.overflow_stats().max_fill_after_round, 0);

        for edge in 0..512 {
            cpu.survival[0].set(edge);
        }
        cpu.scatter(&keys, BitmapSlot::One, &later, false);
        cpu.counts_two.fill(0);
        cpu.scatter(&keys, BitmapSlot::One, &later, true);
        let stats = cpu.overflow_stats();
        assert_eq!(stats.max_fill_initial, initial);
        assert!(stats.max_fill_after_round > initial);
        assert!(stats.max_fill_destination > 0);
    }

    #[tokio::test]
    async fn test_wait_reports_kernel_time() {
        let (mut cpu, plan) = backend(12, 2, 2);
        cpu.begin_job(BitmapSlot::Two, &SipHashKeys([1, 1, 2, 3])).unwrap();
        for (_, stage) in plan.stages() {
            cpu.record(stage).unwrap();
        }
        let submission = cpu.submit().unwrap();
        let busy = cpu.wait(submission).await.unwrap();
        assert!(busy.is_some_and(|time| time > Duration::ZERO));
    }
}
