//! Trimming kernels and their launch geometry
//!
//! Six kernels make up the pipeline. Each is specialized at build time on
//! the [`ResourceSizing`] and on a work-group size derived from the device
//! limits.

use crate::sizing::{bit_floor, ResourceSizing};

/// Scatter work groups never exceed this many invocations
pub const MAX_SCATTER_WORK_GROUP_SIZE: u64 = 512;

/// Cap applied to every work-group size
pub const WORK_GROUP_SIZE_CAP: u64 = 32767 / 2;

/// Kernel entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelId {
    /// Hash edges of one part and append them to source buckets
    ScatterSource,
    /// Mark nodes of the source buckets in the node bitmap
    MarkSource,
    /// Test source bucket edges against the node bitmap
    FilterSource,
    /// Append surviving edges of a part group to destination buckets
    ScatterDestination,
    /// Mark nodes of the destination buckets in the node bitmap
    MarkDestination,
    /// Test destination bucket edges against the node bitmap
    FilterDestination,
}

impl KernelId {
    /// Every kernel, in pipeline order
    pub const ALL: [Self; 6] = [
        Self::ScatterSource,
        Self::MarkSource,
        Self::FilterSource,
        Self::ScatterDestination,
        Self::MarkDestination,
        Self::FilterDestination,
    ];

    /// WGSL entry point name
    #[must_use]
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::ScatterSource => "scatter_source",
            Self::MarkSource => "mark_source",
            Self::FilterSource => "filter_source",
            Self::ScatterDestination => "scatter_destination",
            Self::MarkDestination => "mark_destination",
            Self::FilterDestination => "filter_destination",
        }
    }

    /// Whether the kernel walks edge ranges rather than buckets
    #[must_use]
    pub fn is_scatter(self) -> bool {
        matches!(self, Self::ScatterSource | Self::ScatterDestination)
    }

    /// Name of the WGSL constant holding this kernel's work-group size
    #[must_use]
    pub fn work_group_constant(self) -> &'static str {
        match self {
            Self::ScatterSource => "WG_SCATTER_SOURCE",
            Self::MarkSource => "WG_MARK_SOURCE",
            Self::FilterSource => "WG_FILTER_SOURCE",
            Self::ScatterDestination => "WG_SCATTER_DESTINATION",
            Self::MarkDestination => "WG_MARK_DESTINATION",
            Self::FilterDestination => "WG_FILTER_DESTINATION",
        }
    }
}

/// Device limits that shape the launch geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest number of invocations in one work group
    pub max_work_group_size: u64,
    /// Work-group local memory in bytes
    pub local_memory_bytes: u64,
    /// Largest work-group count in one dispatch dimension
    pub max_work_groups_per_dimension: u64,
}

/// Work-group size of every kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroupSizes {
    sizes: [u64; 6],
}

impl WorkGroupSizes {
    /// Derive sizes from the device limits
    ///
    /// Every size is a power of two no larger than the device maximum and
    /// [`WORK_GROUP_SIZE_CAP`]. Scatter kernels are further held to
    /// [`MAX_SCATTER_WORK_GROUP_SIZE`] and to their own work-item count so a
    /// small graph never launches idle invocations.
    #[must_use]
    pub fn derive(limits: &DeviceLimits, sizing: &ResourceSizing) -> Self {
        let ideal = bit_floor(limits.max_work_group_size).min(bit_floor(WORK_GROUP_SIZE_CAP));
        let scatter_items = sizing.edges_per_part() / sizing.edges_per_scatter_item;
        let scatter = bit_floor(limits.max_work_group_size.min(MAX_SCATTER_WORK_GROUP_SIZE))
            .min(ideal)
            .min(scatter_items)
            .max(1);

        let mut sizes = [ideal.max(1); 6];
        for kernel in KernelId::ALL {
            if kernel.is_scatter() {
                sizes[kernel as usize] = scatter;
            }
        }
        Self { sizes }
    }

    /// Size used for `kernel`
    #[must_use]
    pub fn get(&self, kernel: KernelId) -> u64 {
        self.sizes[kernel as usize]
    }

    /// Total work items launched for one dispatch of `kernel` over `edges` edges
    ///
    /// `edges` only matters for scatter kernels; bucket kernels launch one
    /// work group per bucket.
    #[must_use]
    pub fn total_work_items(&self, kernel: KernelId, sizing: &ResourceSizing, edges: u64) -> u64 {
        match kernel {
            KernelId::ScatterSource | KernelId::ScatterDestination => {
                edges / sizing.edges_per_scatter_item
            }
            KernelId::MarkSource | KernelId::FilterSource => sizing.buckets_one * self.get(kernel),
            KernelId::MarkDestination | KernelId::FilterDestination => {
                sizing.buckets_two * self.get(kernel)
            }
        }
    }

    /// Work groups launched for one dispatch of `kernel` over `edges` edges
    #[must_use]
    pub fn work_groups(&self, kernel: KernelId, sizing: &ResourceSizing, edges: u64) -> u64 {
        self.total_work_items(kernel, sizing, edges)
            .div_ceil(self.get(kernel))
            .max(1)
    }
}

/// Render the compile-time constants prepended to the kernel source
///
/// `first_bucket_words` is the number of source bucket words held by the
/// first source bucket buffer; indices past it go to the second one.
#[must_use]
pub fn shader_constants(
    sizing: &ResourceSizing,
    sizes: &WorkGroupSizes,
    first_bucket_words: u64,
) -> String {
    let mut out = String::new();
    let mut constant = |name: &str, value: u64| {
        out.push_str(&format!("const {name}: u32 = {value}u;\n"));
    };
    constant("EDGE_BITS", u64::from(sizing.edge_bits));
    constant("EDGE_MASK", sizing.number_of_edges - 1);
    constant("SORT_BITS_ONE", u64::from(sizing.sort_bits_one));
    constant("SORT_BITS_TWO", u64::from(sizing.sort_bits_two));
    constant("BUCKETS_ONE", sizing.buckets_one);
    constant("BUCKETS_TWO", sizing.buckets_two);
    constant("BITMAP_WORDS", sizing.bitmap_bytes / 4);
    constant("BUCKET_NODE_MASK", sizing.nodes_per_bucket_one() - 1);
    constant("STRIDE_TWO", sizing.after_round_max_per_remaining_bucket);
    constant("EDGES_PER_ITEM", sizing.edges_per_scatter_item);
    constant("FIRST_BUCKET_WORDS", first_bucket_words);
    for kernel in KernelId::ALL {
        constant(kernel.work_group_constant(), sizes.get(kernel));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrimmingConfig;

    fn sizing(edge_bits: u32, parts: u32) -> ResourceSizing {
        let config = TrimmingConfig::new(edge_bits)
            .with_parts(parts)
            .with_local_ram_kb(32)
            .with_trimming_rounds(1);
        ResourceSizing::derive(&config).unwrap()
    }

    fn limits(max_work_group_size: u64) -> DeviceLimits {
        DeviceLimits {
            max_work_group_size,
            local_memory_bytes: 32 * 1024,
            max_work_groups_per_dimension: 65535,
        }
    }

    #[test]
    fn test_sizes_are_powers_of_two_within_limits() {
        let s = sizing(29, 4);
        let sizes = WorkGroupSizes::derive(&limits(1000), &s);
        for kernel in KernelId::ALL {
            let size = sizes.get(kernel);
            assert!(size.is_power_of_two());
            assert!(size <= 1000);
        }
        assert_eq!(sizes.get(KernelId::MarkSource), 512);
        assert_eq!(sizes.get(KernelId::ScatterSource), 512);
    }

    #[test]
    fn test_one_cap_bounds_every_kernel() {
        // a device reporting a huge maximum is held to the shared cap
        let s = sizing(29, 4);
        let sizes = WorkGroupSizes::derive(&limits(1 << 20), &s);
        assert_eq!(sizes.get(KernelId::MarkSource), bit_floor(WORK_GROUP_SIZE_CAP));
        assert_eq!(sizes.get(KernelId::FilterDestination), 8192);
        assert_eq!(sizes.get(KernelId::ScatterSource), MAX_SCATTER_WORK_GROUP_SIZE);
        for kernel in KernelId::ALL {
            assert!(sizes.get(kernel) <= WORK_GROUP_SIZE_CAP);
        }
    }

    #[test]
    fn test_scatter_capped_by_work_items() {
        // 512 edges per part, 512 edges per item: one work item
        let s = sizing(10, 2);
        let sizes = WorkGroupSizes::derive(&limits(256), &s);
        assert_eq!(sizes.get(KernelId::ScatterSource), 1);
        assert_eq!(sizes.get(KernelId::FilterDestination), 256);
        assert_eq!(
            sizes.work_groups(KernelId::ScatterSource, &s, s.edges_per_part()),
            1
        );
    }

    #[test]
    fn test_bucket_kernels_launch_one_group_per_bucket() {
        let s = sizing(24, 8);
        let sizes = WorkGroupSizes::derive(&limits(256), &s);
        assert_eq!(
            sizes.work_groups(KernelId::MarkSource, &s, 0),
            s.buckets_one
        );
        assert_eq!(
            sizes.work_groups(KernelId::FilterDestination, &s, 0),
            s.buckets_two
        );
    }

    #[test]
    fn test_constants_rendered() {
        let s = sizing(10, 2);
        let sizes = WorkGroupSizes::derive(&limits(256), &s);
        let text = shader_constants(&s, &sizes, 536);
        assert!(text.contains("const EDGE_MASK: u32 = 1023u;"));
        assert!(text.contains("const BITMAP_WORDS: u32 = 32u;"));
        assert!(text.contains("const BUCKET_NODE_MASK: u32 = 1023u;"));
        assert!(text.contains("const FIRST_BUCKET_WORDS: u32 = 536u;"));
        assert!(text.contains("const WG_SCATTER_SOURCE: u32 = 1u;"));
        assert_eq!(text.lines().count(), 11 + KernelId::ALL.len());
        assert!(text.ends_with('\n'));
        assert!(text
            .lines()
            .all(|line| line.starts_with("const ") && line.ends_with("u;")));
    }
}
