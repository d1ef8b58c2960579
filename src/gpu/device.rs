//! GPU device acquisition
//!
//! Enumerates wgpu adapters, maps them to [`DeviceCandidate`]s for the
//! backend-independent selection in [`crate::device`], and opens the chosen
//! adapter with its own limits so large bitmaps and bucket arrays fit.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, error};

use crate::config::TrimmingConfig;
use crate::device::{
    report_selection, select_device, DeviceCandidate, DeviceClass, DeviceSelector,
};
use crate::error::TrimError;
use crate::kernels::DeviceLimits;
use crate::sizing::ResourceSizing;

/// GPU device initialization errors
#[derive(Debug, Error)]
pub enum GpuDeviceError {
    /// No compatible GPU adapter found
    #[error("No compatible GPU adapter found")]
    NoAdapter,

    /// Failed to request GPU device
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),

    /// GPU feature not supported
    #[error("GPU feature not supported: {0}")]
    UnsupportedFeature(String),
}

impl From<GpuDeviceError> for TrimError {
    fn from(err: GpuDeviceError) -> Self {
        match err {
            GpuDeviceError::NoAdapter => Self::NoDevice { hint: None },
            GpuDeviceError::DeviceRequest(message) => Self::Enumeration(message),
            GpuDeviceError::UnsupportedFeature(feature) => Self::NoDevice {
                hint: Some(format!("missing {feature}")),
            },
        }
    }
}

/// Opened wgpu device used for trimming
///
/// # Example
///
/// ```ignore
/// # use slean_trimmer::gpu::GpuDevice;
/// let device = GpuDevice::new().await?;
/// println!("{}", device.name());
/// ```
#[derive(Debug)]
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
    device_error: Arc<Mutex<Option<String>>>,
}

impl GpuDevice {
    /// Check if GPU is available without keeping a device
    ///
    /// This is useful for tests to skip gracefully when GPU is not available.
    pub async fn is_gpu_available() -> bool {
        Self::new().await.is_ok()
    }

    /// Open the default high-performance adapter
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if no adapter exists, it lacks compute
    /// shaders, or the device request fails.
    pub async fn new() -> Result<Self, GpuDeviceError> {
        Self::new_with_backend(wgpu::Backends::all()).await
    }

    /// Open the default high-performance adapter of `backends`
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if device initialization fails
    pub async fn new_with_backend(backends: wgpu::Backends) -> Result<Self, GpuDeviceError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuDeviceError::NoAdapter)?;

        Self::open(adapter).await
    }

    /// Enumerate every adapter, pick one for `sizing` and open it
    ///
    /// Logs the chosen device and, when its local memory exceeds the
    /// configured budget, a rebuild hint.
    ///
    /// # Errors
    ///
    /// [`TrimError::Enumeration`] when no adapter is reported,
    /// [`TrimError::NoDevice`] when none qualifies or the chosen one cannot be
    /// opened.
    pub async fn acquire(
        config: &TrimmingConfig,
        sizing: &ResourceSizing,
        selector: DeviceSelector,
    ) -> Result<Self, TrimError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let mut adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let candidates: Vec<DeviceCandidate> = adapters.iter().map(candidate).collect();
        for c in &candidates {
            debug!(
                "Found {} ({:?}, {} bytes, {} bytes local)",
                c.name, c.class, c.memory_bytes, c.local_memory_bytes
            );
        }

        let selection = select_device(&candidates, selector, sizing, config.local_ram_kb)
            .map_err(|e| {
                error!("No usable GPU for {} edge bits: {e}", sizing.edge_bits);
                e
            })?;
        let adapter = adapters.swap_remove(selection.position);
        let device = Self::open(adapter).await.map_err(|e| {
            error!("Opening {} failed: {e}", selection.name);
            TrimError::from(e)
        })?;
        report_selection(&selection);
        Ok(device)
    }

    async fn open(adapter: wgpu::Adapter) -> Result<Self, GpuDeviceError> {
        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(GpuDeviceError::UnsupportedFeature(
                "compute shaders".to_string(),
            ));
        }

        // timestamps are optional, trimming time falls back to wall time
        let required_features = adapter.features() & wgpu::Features::TIMESTAMP_QUERY;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("slean-trimmer GPU device"),
                    required_features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| GpuDeviceError::DeviceRequest(e.to_string()))?;

        let device_error = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&device_error);
        device.on_uncaptured_error(Box::new(move |e: wgpu::Error| {
            let mut slot = sink.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| e.to_string());
        }));

        Ok(Self {
            device,
            queue,
            adapter,
            device_error,
        })
    }

    /// Get adapter info (GPU name, backend, etc.)
    #[must_use]
    pub fn info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Adapter name
    #[must_use]
    pub fn name(&self) -> String {
        self.info().name
    }

    /// Whether compute passes can write timestamp queries
    #[must_use]
    pub fn supports_timestamps(&self) -> bool {
        self.device.features().contains(wgpu::Features::TIMESTAMP_QUERY)
    }

    /// Limits that shape the kernels' launch geometry
    #[must_use]
    pub fn kernel_limits(&self) -> DeviceLimits {
        kernel_limits(&self.device.limits())
    }

    /// Take the first uncaptured device error reported since the last call
    pub fn take_device_error(&self) -> Option<String> {
        self.device_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Create empty GPU buffer
    ///
    /// Allocation failures surface through an error scope or
    /// [`take_device_error`](Self::take_device_error).
    #[must_use]
    pub fn create_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Get device reference
    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get queue reference
    #[must_use]
    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

/// Kernel-relevant subset of wgpu limits
#[must_use]
pub fn kernel_limits(limits: &wgpu::Limits) -> DeviceLimits {
    DeviceLimits {
        max_work_group_size: u64::from(
            limits
                .max_compute_invocations_per_workgroup
                .min(limits.max_compute_workgroup_size_x),
        ),
        local_memory_bytes: u64::from(limits.max_compute_workgroup_storage_size),
        max_work_groups_per_dimension: u64::from(limits.max_compute_workgroups_per_dimension),
    }
}

// Slot bind group: seven storage buffers and the keys uniform; params in a second group
const STORAGE_BINDINGS: u32 = 7;
const BIND_GROUPS: u32 = 2;

fn candidate(adapter: &wgpu::Adapter) -> DeviceCandidate {
    describe(
        adapter.get_info(),
        &adapter.limits(),
        &adapter.get_downlevel_capabilities(),
    )
}

fn describe(
    info: wgpu::AdapterInfo,
    limits: &wgpu::Limits,
    downlevel: &wgpu::DownlevelCapabilities,
) -> DeviceCandidate {
    let class = match info.device_type {
        wgpu::DeviceType::DiscreteGpu => DeviceClass::DiscreteGpu,
        wgpu::DeviceType::IntegratedGpu => DeviceClass::IntegratedGpu,
        wgpu::DeviceType::VirtualGpu => DeviceClass::VirtualGpu,
        wgpu::DeviceType::Cpu => DeviceClass::Cpu,
        wgpu::DeviceType::Other => DeviceClass::Other,
    };
    let api_compatible = downlevel
        .flags
        .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
    DeviceCandidate {
        name: info.name,
        class,
        api_compatible,
        // the trimming layouts must be creatable on the device
        available: api_compatible
            && limits.max_storage_buffers_per_shader_stage >= STORAGE_BINDINGS
            && limits.max_bind_groups >= BIND_GROUPS
            && limits.max_dynamic_uniform_buffers_per_pipeline_layout >= 1,
        // Estimate VRAM from buffer size limit
        memory_bytes: limits.max_buffer_size,
        local_memory_bytes: u64::from(limits.max_compute_workgroup_storage_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gpu_device_creation() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_gpu_device_creation: GPU not available");
            return;
        }

        let device = GpuDevice::new().await.unwrap();
        assert!(!device.name().is_empty(), "Adapter name should not be empty");
        assert!(device.take_device_error().is_none());
        // timestamps are enabled exactly when the adapter offers them
        assert_eq!(
            device.supports_timestamps(),
            device.adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY)
        );
    }

    #[test]
    fn test_device_errors_convert_to_trim_errors() {
        assert!(matches!(
            TrimError::from(GpuDeviceError::NoAdapter),
            TrimError::NoDevice { hint: None }
        ));
        let err = TrimError::from(GpuDeviceError::UnsupportedFeature("compute shaders".into()));
        assert_eq!(
            err.to_string(),
            "No compatible GPU found (missing compute shaders)"
        );
        let err = TrimError::from(GpuDeviceError::DeviceRequest("lost".into()));
        assert!(matches!(err, TrimError::Enumeration(message) if message.contains("lost")));
    }

    fn adapter_info(device_type: wgpu::DeviceType) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: "test adapter".to_string(),
            vendor: 0,
            device: 0,
            device_type,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        }
    }

    #[test]
    fn test_availability_follows_compute_support_and_layout_limits() {
        let full = wgpu::DownlevelCapabilities::default();
        let gpu = describe(
            adapter_info(wgpu::DeviceType::DiscreteGpu),
            &wgpu::Limits::default(),
            &full,
        );
        assert!(gpu.api_compatible && gpu.available);
        assert_eq!(gpu.class, DeviceClass::DiscreteGpu);

        let no_compute = wgpu::DownlevelCapabilities {
            flags: wgpu::DownlevelFlags::empty(),
            ..wgpu::DownlevelCapabilities::default()
        };
        let legacy = describe(
            adapter_info(wgpu::DeviceType::IntegratedGpu),
            &wgpu::Limits::default(),
            &no_compute,
        );
        assert!(!legacy.api_compatible && !legacy.available);

        // four storage buffers per stage cannot hold the slot bind group
        let small = describe(
            adapter_info(wgpu::DeviceType::IntegratedGpu),
            &wgpu::Limits::downlevel_defaults(),
            &full,
        );
        assert!(small.api_compatible);
        assert!(!small.available);
    }

    #[test]
    fn test_kernel_limits_use_tighter_work_group_bound() {
        let limits = wgpu::Limits {
            max_compute_invocations_per_workgroup: 1024,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_storage_size: 32768,
            ..wgpu::Limits::default()
        };
        let kernel = kernel_limits(&limits);
        assert_eq!(kernel.max_work_group_size, 256);
        assert_eq!(kernel.local_memory_bytes, 32768);
    }

    #[tokio::test]
    async fn test_acquire_small_graph() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_acquire_small_graph: GPU not available");
            return;
        }

        let config = TrimmingConfig::new(12)
            .with_parts(2)
            .with_local_ram_kb(32)
            .with_trimming_rounds(2);
        let sizing = ResourceSizing::derive(&config).unwrap();
        match GpuDevice::acquire(&config, &sizing, DeviceSelector::First).await {
            Ok(device) => assert!(device.kernel_limits().max_work_group_size > 0),
            // software adapters are enumerated but never qualify
            Err(err) => assert!(matches!(err, TrimError::NoDevice { .. })),
        }
    }
}
