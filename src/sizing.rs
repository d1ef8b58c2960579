//! Resource sizing
//!
//! Pure arithmetic from a [`TrimmingConfig`] to every bucket count, bucket
//! capacity, bitmap size and radix shift the pipeline needs. Kernels and
//! buffers are specialized on these values, so they never change within a
//! session.

use crate::config::TrimmingConfig;
use crate::error::{Result, TrimError};

/// Bits in a byte
pub const BITS_IN_A_BYTE: u64 = 8;

/// Bytes in a kilobyte
pub const BYTES_IN_A_KILOBYTE: u64 = 1024;

/// Upper bound on edges hashed by one scatter work item
pub const MAX_EDGES_PER_SCATTER_ITEM: u64 = 1024;

/// Number of significant bits in `value` (zero for zero)
#[must_use]
pub fn bit_width(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

/// Largest power of two that is `<= value` (zero for zero)
#[must_use]
pub fn bit_floor(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        1u64 << (bit_width(value) - 1)
    }
}

/// Every size the trimming pipeline is specialized on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceSizing {
    /// log2 of the edge count
    pub edge_bits: u32,
    /// Number of edge-space parts
    pub parts: u32,
    /// `2^edge_bits`
    pub number_of_edges: u64,
    /// Bytes of one full edge or node bitmap
    pub full_bitmap_bytes: u64,
    /// Local bitmap bytes covering one source bucket's node range
    pub bitmap_bytes: u64,
    /// Number of source buckets
    pub buckets_one: u64,
    /// Low node bits ignored when picking a source bucket
    pub sort_bits_one: u32,
    /// Edges of one part expected per source bucket
    pub items_per_bucket: u64,
    /// Source bucket capacity in round zero
    pub initial_max_per_bucket: u64,
    /// Source bucket capacity in later rounds
    pub after_round_max_per_bucket: u64,
    /// Local bitmap bytes for one destination bucket
    pub remaining_bitmap_bytes: u64,
    /// Number of destination buckets
    pub buckets_two: u64,
    /// Low node bits ignored when picking a destination bucket
    pub sort_bits_two: u32,
    /// Edges of one part expected per destination bucket
    pub items_per_remaining_bucket: u64,
    /// Destination bucket capacity
    pub after_round_max_per_remaining_bucket: u64,
    /// Edges hashed by one scatter work item
    pub edges_per_scatter_item: u64,
    /// Source buckets a work group could cache locally
    pub max_local_buckets: u64,
}

impl ResourceSizing {
    /// Derive every size from a configuration
    ///
    /// The configuration is validated first. A derived divisor or capacity of
    /// zero is reported as a configuration error instead of surfacing later
    /// as a division by zero.
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::Config`] for invalid input or a zero-sized result.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn derive(config: &TrimmingConfig) -> Result<Self> {
        config.validate()?;

        let number_of_edges = config.number_of_edges();
        let parts = u64::from(config.parts);
        let local_bytes = u64::from(config.local_ram_kb) * BYTES_IN_A_KILOBYTE;
        let full_bitmap_bytes = number_of_edges / BITS_IN_A_BYTE;

        let bitmap_bytes = local_bytes.min(full_bitmap_bytes);
        let buckets_one = nonzero("source bucket count", full_bitmap_bytes / bitmap_bytes)?;
        let sort_bits_one = config.edge_bits + 1 - bit_width(buckets_one);
        let items_per_bucket = nonzero(
            "edges per source bucket",
            number_of_edges / parts / buckets_one,
        )?;

        let scale = |items: u64, factor: f64| (items as f64 * factor) as u64;
        let initial_max_per_bucket = nonzero(
            "initial source bucket capacity",
            scale(items_per_bucket, config.slack.initial) / 4 * 4,
        )?;
        let after_round_max_per_bucket = nonzero(
            "source bucket capacity after a round",
            scale(items_per_bucket, config.slack.after_round) / 4 * 4,
        )?;

        let part_bitmap_bytes = full_bitmap_bytes / parts;
        let remaining_bitmap_bytes = local_bytes.min(part_bitmap_bytes);
        let buckets_two = nonzero(
            "destination bucket count",
            part_bitmap_bytes / remaining_bitmap_bytes,
        )?;
        let sort_bits_two = config.edge_bits + 1 - bit_width(buckets_two);
        let items_per_remaining_bucket = nonzero(
            "edges per destination bucket",
            number_of_edges / parts / buckets_two,
        )?;
        let after_round_max_per_remaining_bucket = nonzero(
            "destination bucket capacity",
            scale(items_per_remaining_bucket, config.slack.remaining) / parts * parts,
        )?;

        Ok(Self {
            edge_bits: config.edge_bits,
            parts: config.parts,
            number_of_edges,
            full_bitmap_bytes,
            bitmap_bytes,
            buckets_one,
            sort_bits_one,
            items_per_bucket,
            initial_max_per_bucket,
            after_round_max_per_bucket,
            remaining_bitmap_bytes,
            buckets_two,
            sort_bits_two,
            items_per_remaining_bucket,
            after_round_max_per_remaining_bucket,
            edges_per_scatter_item: MAX_EDGES_PER_SCATTER_ITEM.min(number_of_edges / parts),
            max_local_buckets: 4.min((buckets_one + 255) / 256),
        })
    }

    /// Edges in one part
    #[must_use]
    pub fn edges_per_part(&self) -> u64 {
        self.number_of_edges / u64::from(self.parts)
    }

    /// Node values covered by one source bucket
    #[must_use]
    pub fn nodes_per_bucket_one(&self) -> u64 {
        1u64 << self.sort_bits_one
    }

    /// Node values covered by one destination bucket
    #[must_use]
    pub fn nodes_per_bucket_two(&self) -> u64 {
        1u64 << self.sort_bits_two
    }

    /// Words of the full source bucket array
    #[must_use]
    pub fn buckets_one_words(&self) -> u64 {
        self.initial_max_per_bucket * self.buckets_one
    }

    /// Words of the destination bucket array
    #[must_use]
    pub fn buckets_two_words(&self) -> u64 {
        self.after_round_max_per_remaining_bucket * self.buckets_two
    }

    /// Device memory needed by every buffer together
    #[must_use]
    pub fn required_bytes(&self) -> u64 {
        self.buckets_one_words() * 4
            + self.buckets_two_words() * 4
            + self.buckets_one * 4
            + self.buckets_two * 4
            + self.full_bitmap_bytes * 3
    }

    /// Local memory one work group needs for its bitmap window
    #[must_use]
    pub fn required_work_group_bytes(&self) -> u64 {
        self.bitmap_bytes
    }

    /// Source bucket a node value sorts into
    #[must_use]
    pub fn bucket_one_of(&self, node: u64) -> u64 {
        node >> self.sort_bits_one
    }

    /// Destination bucket a node value sorts into
    #[must_use]
    pub fn bucket_two_of(&self, node: u64) -> u64 {
        node >> self.sort_bits_two
    }
}

fn nonzero(what: &str, value: u64) -> Result<u64> {
    if value == 0 {
        Err(TrimError::config(format!("{what} sizes to zero")))
    } else {
        Ok(value)
    }
}
