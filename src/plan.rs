//! Data-driven stage table
//!
//! A [`JobPlan`] is the complete, ordered list of clears and dispatches one job
//! runs. It depends only on the sizing and configuration, so it is built once
//! per session and replayed for every job; the job's keys and bitmap slot are
//! bound separately by the backend.
//!
//! Every round tests one side of the graph. A round is two sweeps over the edge
//! space: the first marks every node that still has an edge, the second drops
//! the edges whose partner node (`node ^ 1`) was never marked. Early rounds
//! sweep one part at a time through the source buckets; later rounds, with
//! fewer edges left, fold several parts into one pass through the smaller
//! destination buckets.

use crate::config::TrimmingConfig;
use crate::kernels::KernelId;
use crate::sizing::ResourceSizing;

/// Buffers reset by a clear stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClearTarget {
    /// Source bucket fill counters
    CountsOne,
    /// Destination bucket fill counters
    CountsTwo,
    /// Node bitmap
    NodeBitmap,
    /// The job's edge-survival bitmap
    SurvivalBitmap,
}

/// Which edges a scatter reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeSelection {
    /// Every edge in range (round zero)
    All,
    /// Only edges whose survival bit is set
    Alive,
}

/// How a filter records its verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    /// Set the bit of every surviving edge in a cleared bitmap
    SetSurvivors,
    /// Clear the bit of every trimmed edge
    ClearTrimmed,
}

/// Per-dispatch arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchArgs {
    /// First edge index of the swept range
    pub edge_offset: u64,
    /// Number of edges in the swept range
    pub edge_count: u64,
    /// Graph side tested (0 or 1)
    pub side: u32,
    /// Edges the scatter reads
    pub selection: EdgeSelection,
    /// Filter verdict mode
    pub filter: FilterMode,
    /// Capacity of one bucket in words
    pub stride: u64,
}

/// One kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Kernel to run
    pub kernel: KernelId,
    /// Arguments rebound before the launch
    pub args: DispatchArgs,
    /// Position of this launch's arguments in [`JobPlan::dispatch_args`]
    pub args_index: usize,
}

/// One entry of the stage table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Zero a buffer
    Clear(ClearTarget),
    /// Launch a kernel
    Dispatch(Dispatch),
}

/// Coarse position of a stage in the job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Round zero: every edge is hashed and scattered
    Scatter,
    /// Intermediate rounds
    DegreeRounds,
    /// Last round's survival test, writing the final bitmap
    Finalize,
}

/// Bucket array a round goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// One part at a time through the source buckets
    Source {
        /// Source bucket capacity for this round
        stride: u64,
    },
    /// Several parts at a time through the destination buckets
    Destination {
        /// Parts folded into one pass
        parts_per_pass: u32,
    },
}

impl Regime {
    /// Regime of `round`
    #[must_use]
    pub fn for_round(round: u32, config: &TrimmingConfig, sizing: &ResourceSizing) -> Self {
        let thresholds = &config.regimes;
        if round == 0 {
            return Self::Source {
                stride: sizing.initial_max_per_bucket,
            };
        }
        if round < thresholds.quarter {
            return Self::Source {
                stride: sizing.after_round_max_per_bucket,
            };
        }
        let factor = if round < thresholds.eighth {
            1
        } else if round < thresholds.sixteenth {
            2
        } else if round < thresholds.thirty_second {
            4
        } else if round < thresholds.sixty_fourth {
            8
        } else {
            16
        };
        Self::Destination {
            parts_per_pass: factor.min(sizing.parts),
        }
    }
}

/// Ordered stage table for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    stages: Vec<(Phase, Stage)>,
    dispatch_args: Vec<DispatchArgs>,
    rounds: u32,
    max_edges: u64,
}

impl JobPlan {
    /// Build the stage table for `config`
    #[must_use]
    pub fn build(config: &TrimmingConfig, sizing: &ResourceSizing) -> Self {
        let mut plan = Self {
            stages: Vec::new(),
            dispatch_args: Vec::new(),
            rounds: config.trimming_rounds,
            max_edges: config.max_edges_after_trimming(),
        };

        plan.push(Phase::Scatter, Stage::Clear(ClearTarget::SurvivalBitmap));
        for round in 0..config.trimming_rounds {
            let side = round % 2;
            let last = round + 1 == config.trimming_rounds;
            let mark_phase = if round == 0 {
                Phase::Scatter
            } else {
                Phase::DegreeRounds
            };
            let filter_phase = if last { Phase::Finalize } else { mark_phase };

            plan.push(mark_phase, Stage::Clear(ClearTarget::NodeBitmap));
            match Regime::for_round(round, config, sizing) {
                Regime::Source { stride } => {
                    let selection = if round == 0 {
                        EdgeSelection::All
                    } else {
                        EdgeSelection::Alive
                    };
                    let filter = if round == 0 {
                        FilterMode::SetSurvivors
                    } else {
                        FilterMode::ClearTrimmed
                    };
                    for (consumer, phase) in [
                        (KernelId::MarkSource, mark_phase),
                        (KernelId::FilterSource, filter_phase),
                    ] {
                        for part in 0..u64::from(sizing.parts) {
                            let args = DispatchArgs {
                                edge_offset: part * sizing.edges_per_part(),
                                edge_count: sizing.edges_per_part(),
                                side,
                                selection,
                                filter,
                                stride,
                            };
                            plan.push(phase, Stage::Clear(ClearTarget::CountsOne));
                            plan.push_dispatch(phase, KernelId::ScatterSource, args);
                            plan.push_dispatch(phase, consumer, args);
                        }
                    }
                }
                Regime::Destination { parts_per_pass } => {
                    let pass_edges = u64::from(parts_per_pass) * sizing.edges_per_part();
                    let passes = u64::from(sizing.parts / parts_per_pass);
                    for (consumer, phase) in [
                        (KernelId::MarkDestination, mark_phase),
                        (KernelId::FilterDestination, filter_phase),
                    ] {
                        for pass in 0..passes {
                            let args = DispatchArgs {
                                edge_offset: pass * pass_edges,
                                edge_count: pass_edges,
                                side,
                                selection: EdgeSelection::Alive,
                                filter: FilterMode::ClearTrimmed,
                                stride: sizing.after_round_max_per_remaining_bucket,
                            };
                            plan.push(phase, Stage::Clear(ClearTarget::CountsTwo));
                            plan.push_dispatch(phase, KernelId::ScatterDestination, args);
                            plan.push_dispatch(phase, consumer, args);
                        }
                    }
                }
            }
        }
        plan
    }

    fn push(&mut self, phase: Phase, stage: Stage) {
        self.stages.push((phase, stage));
    }

    fn push_dispatch(&mut self, phase: Phase, kernel: KernelId, args: DispatchArgs) {
        let args_index = self.dispatch_args.len();
        self.dispatch_args.push(args);
        self.push(
            phase,
            Stage::Dispatch(Dispatch {
                kernel,
                args,
                args_index,
            }),
        );
    }

    /// Stages with their lifecycle phase, in submission order
    #[must_use]
    pub fn stages(&self) -> &[(Phase, Stage)] {
        &self.stages
    }

    /// Arguments of every dispatch, indexed by [`Dispatch::args_index`]
    #[must_use]
    pub fn dispatch_args(&self) -> &[DispatchArgs] {
        &self.dispatch_args
    }

    /// Trimming rounds the plan runs
    #[must_use]
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Edges a trimmed graph is expected to keep at most
    #[must_use]
    pub fn max_edges_after_trimming(&self) -> u64 {
        self.max_edges
    }

    /// Number of kernel launches
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.dispatch_args.len()
    }
}
