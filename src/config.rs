//! Trimming configuration
//!
//! All four size-determining values (edge bits, parts, local RAM budget and
//! round count) are fixed for the lifetime of a session. They can be set in
//! code or read from environment variables.

use crate::error::{Result, TrimError};

/// Number of edges in a Cuckatoo solution cycle
pub const SOLUTION_SIZE: u64 = 42;

/// Smallest supported edge bit width
pub const MIN_EDGE_BITS: u32 = 10;

/// Largest supported edge bit width
pub const MAX_EDGE_BITS: u32 = 32;

/// Largest supported trimming round count
pub const MAX_TRIMMING_ROUNDS: u32 = 20222;

/// Over- and under-provisioning ratios applied to bucket capacities
///
/// These are tuned for the Cuckatoo edge-survival curve. Changing them without
/// re-measuring bucket occupancy risks dropping edges that should survive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlackFactors {
    /// Source bucket capacity before any trimming
    pub initial: f64,
    /// Source bucket capacity once a round has run
    pub after_round: f64,
    /// Destination bucket capacity
    pub remaining: f64,
}

impl Default for SlackFactors {
    fn default() -> Self {
        Self {
            initial: 1.05,
            after_round: 0.73,
            remaining: 0.38,
        }
    }
}

/// Rounds at which the expected surviving edge fraction drops below a bound
///
/// Before `quarter` the source buckets are used. From then on the destination
/// buckets take over and every threshold doubles the number of parts folded
/// into one destination pass, which keeps the expected load of a pass at about
/// a quarter of a part. The defaults were measured by trimming random Cuckatoo
/// graphs: roughly 64%, 31%, 19%, 13% and 9.4% of the edges survive the first
/// five rounds, after which survival decays like `0.36 / rounds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegimeThresholds {
    /// Fewer than 1/4 of the edges remain
    pub quarter: u32,
    /// Fewer than 1/8 of the edges remain
    pub eighth: u32,
    /// Fewer than 1/16 of the edges remain
    pub sixteenth: u32,
    /// Fewer than 1/32 of the edges remain
    pub thirty_second: u32,
    /// Fewer than 1/64 of the edges remain
    pub sixty_fourth: u32,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            quarter: 3,
            eighth: 5,
            sixteenth: 7,
            thirty_second: 12,
            sixty_fourth: 23,
        }
    }
}

impl RegimeThresholds {
    /// Divisor of the edge count bounding what is left after `rounds` rounds
    #[must_use]
    pub fn survival_divisor(rounds: u32) -> u64 {
        let pairs = u64::from(rounds.saturating_add(1) / 2);
        pairs * pairs + 2
    }

    fn is_ordered(&self) -> bool {
        self.quarter >= 1
            && self.quarter <= self.eighth
            && self.eighth <= self.sixteenth
            && self.sixteenth <= self.thirty_second
            && self.thirty_second <= self.sixty_fourth
    }
}

/// Session-wide trimming configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TrimmingConfig {
    /// log2 of the number of edges
    pub edge_bits: u32,
    /// Number of slices the edge space is processed in
    pub parts: u32,
    /// Work-group local memory budget in kilobytes
    pub local_ram_kb: u32,
    /// Number of trimming rounds per job
    pub trimming_rounds: u32,
    /// Bucket capacity ratios
    pub slack: SlackFactors,
    /// Rounds that switch bucket regimes
    pub regimes: RegimeThresholds,
}

impl Default for TrimmingConfig {
    fn default() -> Self {
        Self {
            edge_bits: 31,
            parts: 4,
            local_ram_kb: 64,
            trimming_rounds: 90,
            slack: SlackFactors::default(),
            regimes: RegimeThresholds::default(),
        }
    }
}

impl TrimmingConfig {
    /// Create a configuration for the given edge bit width with default everything else
    #[must_use]
    pub fn new(edge_bits: u32) -> Self {
        Self {
            edge_bits,
            ..Self::default()
        }
    }

    /// Set the number of parts
    #[must_use]
    pub fn with_parts(mut self, parts: u32) -> Self {
        self.parts = parts;
        self
    }

    /// Set the local memory budget in kilobytes
    #[must_use]
    pub fn with_local_ram_kb(mut self, local_ram_kb: u32) -> Self {
        self.local_ram_kb = local_ram_kb;
        self
    }

    /// Set the number of trimming rounds
    #[must_use]
    pub fn with_trimming_rounds(mut self, trimming_rounds: u32) -> Self {
        self.trimming_rounds = trimming_rounds;
        self
    }

    /// Set the regime thresholds
    #[must_use]
    pub fn with_regimes(mut self, regimes: RegimeThresholds) -> Self {
        self.regimes = regimes;
        self
    }

    /// Read overrides from `EDGE_BITS`, `SLEAN_TRIMMING_PARTS`,
    /// `LOCAL_RAM_KILOBYTES` and `TRIMMING_ROUNDS`, then validate
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::Config`] if a variable is not a number or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable source
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::Config`] on unparsable or invalid values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let read = |name: &str, slot: &mut u32| -> Result<()> {
            if let Some(raw) = lookup(name) {
                *slot = raw.trim().parse().map_err(|_| {
                    TrimError::config(format!("{name} must be an unsigned integer, got {raw:?}"))
                })?;
            }
            Ok(())
        };
        read("EDGE_BITS", &mut config.edge_bits)?;
        read("SLEAN_TRIMMING_PARTS", &mut config.parts)?;
        read("LOCAL_RAM_KILOBYTES", &mut config.local_ram_kb)?;
        read("TRIMMING_ROUNDS", &mut config.trimming_rounds)?;
        config.validate()?;
        Ok(config)
    }

    /// Total number of edges, `2^edge_bits`
    #[must_use]
    pub fn number_of_edges(&self) -> u64 {
        1u64 << self.edge_bits
    }

    /// Mask applied to hashed node values
    #[must_use]
    pub fn edge_mask(&self) -> u64 {
        self.number_of_edges() - 1
    }

    /// Upper bound on the number of edges a job can hand to the consumer
    #[must_use]
    pub fn max_edges_after_trimming(&self) -> u64 {
        let edges = self.number_of_edges();
        if self.trimming_rounds == 0 {
            return edges;
        }
        let divisor = RegimeThresholds::survival_divisor(self.trimming_rounds);
        edges.div_ceil(divisor).saturating_sub(1).max(1)
    }

    /// Check every value against the supported ranges
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::Config`] describing the first violated limit.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_EDGE_BITS..=MAX_EDGE_BITS).contains(&self.edge_bits) {
            return Err(TrimError::config(format!(
                "EDGE_BITS must be in {MIN_EDGE_BITS}..={MAX_EDGE_BITS}, got {}",
                self.edge_bits
            )));
        }
        if !(2..=16).contains(&self.parts) || !self.parts.is_power_of_two() {
            return Err(TrimError::config(format!(
                "SLEAN_TRIMMING_PARTS must be a power of two in 2..=16, got {}",
                self.parts
            )));
        }
        if !(32..=256).contains(&self.local_ram_kb) || !self.local_ram_kb.is_power_of_two() {
            return Err(TrimError::config(format!(
                "LOCAL_RAM_KILOBYTES must be a power of two in 32..=256, got {}",
                self.local_ram_kb
            )));
        }
        if !(1..=MAX_TRIMMING_ROUNDS).contains(&self.trimming_rounds) {
            return Err(TrimError::config(format!(
                "TRIMMING_ROUNDS must be in 1..={MAX_TRIMMING_ROUNDS}, got {}",
                self.trimming_rounds
            )));
        }
        let pairs = u64::from(self.trimming_rounds.div_ceil(2)) + 1;
        if self.number_of_edges() / (pairs * pairs + 2) < SOLUTION_SIZE {
            return Err(TrimError::config(format!(
                "TRIMMING_ROUNDS={} would trim {} edges below a solution's {SOLUTION_SIZE}",
                self.trimming_rounds,
                self.number_of_edges()
            )));
        }
        let slack = self.slack;
        if !(slack.initial > 1.0 && slack.after_round > 0.0 && slack.remaining > 0.0) {
            return Err(TrimError::config(format!(
                "slack factors out of range: {slack:?}"
            )));
        }
        if !self.regimes.is_ordered() {
            return Err(TrimError::config(format!(
                "regime thresholds must be non-decreasing and start at round 1 or later: {:?}",
                self.regimes
            )));
        }
        Ok(())
    }
}
