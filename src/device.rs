//! Device selection
//!
//! Backend-independent filtering of enumerated devices. The wgpu backend maps
//! its adapters to [`DeviceCandidate`]s and lets [`select_device`] pick one.

use tracing::{info, warn};

use crate::error::{Result, TrimError};
use crate::sizing::{bit_floor, ResourceSizing, BYTES_IN_A_KILOBYTE};

/// Broad class of a compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Dedicated GPU
    DiscreteGpu,
    /// GPU sharing memory with the host
    IntegratedGpu,
    /// Virtualized GPU
    VirtualGpu,
    /// Software rasterizer or CPU device
    Cpu,
    /// Anything else
    Other,
}

impl DeviceClass {
    /// Whether the class counts as a GPU for trimming
    #[must_use]
    pub fn is_gpu(self) -> bool {
        matches!(
            self,
            Self::DiscreteGpu | Self::IntegratedGpu | Self::VirtualGpu
        )
    }
}

/// Capabilities of one enumerated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    /// Human-readable name
    pub name: String,
    /// Device class
    pub class: DeviceClass,
    /// Whether the device supports the compute features the kernels need
    pub api_compatible: bool,
    /// Whether the device can be opened
    pub available: bool,
    /// Usable device memory in bytes
    pub memory_bytes: u64,
    /// Work-group local memory in bytes
    pub local_memory_bytes: u64,
}

/// Which qualifying device to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The first device that passes every filter
    #[default]
    First,
    /// The Nth (1-based) device that passes the class, API and availability filters
    Index(usize),
}

/// Suggestion to rebuild with a larger local memory budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMemoryHint {
    /// Budget the device could support, in kilobytes
    pub suggested_local_ram_kb: u64,
}

/// Result of [`select_device`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Position of the chosen device in the enumerated list
    pub position: usize,
    /// Name of the chosen device
    pub name: String,
    /// Set when the device has more local memory than the configured budget
    pub local_memory_hint: Option<LocalMemoryHint>,
}

/// Pick a device from `candidates`
///
/// Filters apply in order: GPU class, API compatibility and availability,
/// then the selector index, then total memory against
/// [`ResourceSizing::required_bytes`] and local memory against
/// [`ResourceSizing::required_work_group_bytes`]. An indexed device that fails
/// the memory filters is not replaced by another one.
///
/// # Errors
///
/// [`TrimError::Enumeration`] when `candidates` is empty, otherwise
/// [`TrimError::NoDevice`] when nothing qualifies.
pub fn select_device(
    candidates: &[DeviceCandidate],
    selector: DeviceSelector,
    sizing: &ResourceSizing,
    local_ram_kb: u32,
) -> Result<Selection> {
    if candidates.is_empty() {
        return Err(TrimError::Enumeration(
            "the platform reported no compute devices".to_string(),
        ));
    }

    let mut capable = 0usize;
    let mut best_local_memory = 0u64;
    for (position, candidate) in candidates.iter().enumerate() {
        if !(candidate.class.is_gpu() && candidate.api_compatible && candidate.available) {
            continue;
        }
        capable += 1;
        if let DeviceSelector::Index(index) = selector {
            if index != capable {
                continue;
            }
        }
        best_local_memory = best_local_memory.max(candidate.local_memory_bytes);
        if candidate.memory_bytes >= sizing.required_bytes()
            && candidate.local_memory_bytes >= sizing.required_work_group_bytes()
        {
            return Ok(Selection {
                position,
                name: candidate.name.clone(),
                local_memory_hint: local_memory_hint(candidate.local_memory_bytes, local_ram_kb),
            });
        }
        if matches!(selector, DeviceSelector::Index(_)) {
            break;
        }
    }

    let hint = (best_local_memory > 0 && best_local_memory < sizing.required_work_group_bytes())
        .then(|| {
            format!(
                "build with LOCAL_RAM_KILOBYTES={} or lower",
                bit_floor(best_local_memory) / BYTES_IN_A_KILOBYTE
            )
        });
    Err(TrimError::NoDevice { hint })
}

fn local_memory_hint(local_memory_bytes: u64, local_ram_kb: u32) -> Option<LocalMemoryHint> {
    let available_kb = bit_floor(local_memory_bytes) / BYTES_IN_A_KILOBYTE;
    (available_kb > u64::from(local_ram_kb)).then_some(LocalMemoryHint {
        suggested_local_ram_kb: available_kb,
    })
}

/// Log the selection the way operators expect to see it
pub fn report_selection(selection: &Selection) {
    info!("Using {} for slean trimming", selection.name);
    if let Some(hint) = selection.local_memory_hint {
        warn!(
            "GPU's local RAM won't be fully utilized. Build this program with \
             LOCAL_RAM_KILOBYTES={} for potentially better performance",
            hint.suggested_local_ram_kb
        );
    }
}
