//! Two-step kernel build
//!
//! Step one compiles the sizing-specialized module with provisional
//! work-group sizes to surface compiler diagnostics early. Step two derives the
//! final sizes from the device limits and builds one pipeline per kernel with
//! them hard-coded.

use tracing::{debug, error, info};

use super::GpuDevice;
use crate::error::{Result, TrimError};
use crate::kernels::{shader_constants, DeviceLimits, KernelId, WorkGroupSizes};
use crate::plan::{DispatchArgs, EdgeSelection, FilterMode};
use crate::sizing::ResourceSizing;

const SHADER: &str = include_str!("shaders/slean.wgsl");

/// Size of [`StageParams`] in bytes
pub const STAGE_PARAMS_SIZE: u64 = std::mem::size_of::<StageParams>() as u64;

/// Per-dispatch arguments as the kernels read them
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StageParams {
    edge_offset: u32,
    edge_count: u32,
    side: u32,
    selection: u32,
    filter_mode: u32,
    stride: u32,
    _padding: [u32; 2],
}

impl From<&DispatchArgs> for StageParams {
    #[allow(clippy::cast_possible_truncation)]
    fn from(args: &DispatchArgs) -> Self {
        Self {
            edge_offset: args.edge_offset as u32,
            edge_count: args.edge_count as u32,
            side: args.side,
            selection: match args.selection {
                EdgeSelection::All => 0,
                EdgeSelection::Alive => 1,
            },
            filter_mode: match args.filter {
                FilterMode::SetSurvivors => 0,
                FilterMode::ClearTrimmed => 1,
            },
            stride: args.stride as u32,
            _padding: [0; 2],
        }
    }
}

/// Render the full kernel source for one specialization
#[must_use]
pub fn shader_source(
    sizing: &ResourceSizing,
    sizes: &WorkGroupSizes,
    first_bucket_words: u64,
) -> String {
    let mut source = shader_constants(sizing, sizes, first_bucket_words);
    source.push('\n');
    source.push_str(SHADER);
    source
}

/// Compiled trimming kernels and their bind group layouts
#[derive(Debug)]
pub struct TrimmingPipelines {
    sizes: WorkGroupSizes,
    limits: DeviceLimits,
    slot_layout: wgpu::BindGroupLayout,
    params_layout: wgpu::BindGroupLayout,
    pipelines: Vec<wgpu::ComputePipeline>,
}

impl TrimmingPipelines {
    /// Build every kernel for `sizing`
    ///
    /// # Errors
    ///
    /// Returns [`TrimError::PipelineBuild`] with the compiler log when the
    /// module or a pipeline fails validation.
    #[allow(clippy::too_many_lines)]
    pub async fn build(
        device: &GpuDevice,
        sizing: &ResourceSizing,
        first_bucket_words: u64,
    ) -> Result<Self> {
        // Step 1: provisional compile
        let provisional_limits = super::device::kernel_limits(&wgpu::Limits::downlevel_defaults());
        let provisional = WorkGroupSizes::derive(&provisional_limits, sizing);
        let provisional_module = compile(
            device,
            "Slean Shader (provisional)",
            shader_source(sizing, &provisional, first_bucket_words),
        )
        .await?;

        // Step 2: final sizes from the device
        let limits = device.kernel_limits();
        let sizes = WorkGroupSizes::derive(&limits, sizing);
        let module = if sizes == provisional {
            provisional_module
        } else {
            compile(
                device,
                "Slean Shader",
                shader_source(sizing, &sizes, first_bucket_words),
            )
            .await?
        };

        let slot_layout =
            device
                .device()
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Slean Slot Bind Group Layout"),
                    entries: &[
                        // @binding(0): storage buckets_one_a (read_write)
                        storage_entry(0),
                        // @binding(1): storage buckets_one_b (read_write)
                        storage_entry(1),
                        // @binding(2): storage counts_one (read_write, atomic)
                        storage_entry(2),
                        // @binding(3): storage buckets_two (read_write)
                        storage_entry(3),
                        // @binding(4): storage counts_two (read_write, atomic)
                        storage_entry(4),
                        // @binding(5): storage nodes (read_write, atomic)
                        storage_entry(5),
                        // @binding(6): storage survival bitmap of the slot (read_write, atomic)
                        storage_entry(6),
                        // @binding(7): uniform SipHash keys of the slot
                        wgpu::BindGroupLayoutEntry {
                            binding: 7,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: wgpu::BufferSize::new(32),
                            },
                            count: None,
                        },
                    ],
                });

        let params_layout =
            device
                .device()
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Slean Params Bind Group Layout"),
                    entries: &[
                        // @binding(0): uniform stage params (dynamic offset)
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: true,
                                min_binding_size: wgpu::BufferSize::new(STAGE_PARAMS_SIZE),
                            },
                            count: None,
                        },
                    ],
                });

        let pipeline_layout = device
            .device()
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Slean Pipeline Layout"),
                bind_group_layouts: &[&slot_layout, &params_layout],
                push_constant_ranges: &[],
            });

        device
            .device()
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let pipelines: Vec<wgpu::ComputePipeline> = KernelId::ALL
            .iter()
            .map(|kernel| {
                device
                    .device()
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(kernel.entry_point()),
                        layout: Some(&pipeline_layout),
                        module: &module,
                        entry_point: kernel.entry_point(),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        cache: None,
                    })
            })
            .collect();
        if let Some(err) = device.device().pop_error_scope().await {
            error!("Building program for the GPU failed: {err}");
            return Err(TrimError::PipelineBuild {
                stage: "creating compute pipelines".to_string(),
                log: err.to_string(),
            });
        }

        info!(
            "Built {} trimming kernels (mark work group {}, scatter work group {})",
            pipelines.len(),
            sizes.get(KernelId::MarkSource),
            sizes.get(KernelId::ScatterSource)
        );
        Ok(Self {
            sizes,
            limits,
            slot_layout,
            params_layout,
            pipelines,
        })
    }

    /// Pipeline of `kernel`
    #[must_use]
    pub fn get(&self, kernel: KernelId) -> &wgpu::ComputePipeline {
        &self.pipelines[kernel as usize]
    }

    /// Final work-group sizes
    #[must_use]
    pub fn sizes(&self) -> &WorkGroupSizes {
        &self.sizes
    }

    /// Device limits the sizes were derived from
    #[must_use]
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Layout of the per-slot bind group (group 0)
    #[must_use]
    pub fn slot_layout(&self) -> &wgpu::BindGroupLayout {
        &self.slot_layout
    }

    /// Layout of the stage params bind group (group 1)
    #[must_use]
    pub fn params_layout(&self) -> &wgpu::BindGroupLayout {
        &self.params_layout
    }
}

/// Split `groups` work groups over x and y when one dimension is too small
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn dispatch_dimensions(groups: u64, max_per_dimension: u64) -> (u32, u32) {
    let max = max_per_dimension.max(1);
    if groups <= max {
        return (groups as u32, 1);
    }
    (max as u32, groups.div_ceil(max) as u32)
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

async fn compile(device: &GpuDevice, label: &str, source: String) -> Result<wgpu::ShaderModule> {
    device
        .device()
        .push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device
        .device()
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
    let log = compilation_log(&module.get_compilation_info().await);
    if let Some(err) = device.device().pop_error_scope().await {
        error!("Building program for the GPU failed: {label}");
        return Err(TrimError::PipelineBuild {
            stage: label.to_string(),
            log: if log.is_empty() { err.to_string() } else { log },
        });
    }
    if !log.is_empty() {
        debug!("{label} compiler output:\n{log}");
    }
    Ok(module)
}

fn compilation_log(info: &wgpu::CompilationInfo) -> String {
    info.messages
        .iter()
        .map(|message| match &message.location {
            Some(location) => format!(
                "{}:{}: {:?}: {}",
                location.line_number, location.line_position, message.message_type, message.message
            ),
            None => format!("{:?}: {}", message.message_type, message.message),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrimmingConfig;
    use serial_test::serial;

    fn sizing() -> ResourceSizing {
        let config = TrimmingConfig::new(12)
            .with_parts(2)
            .with_local_ram_kb(32)
            .with_trimming_rounds(4);
        ResourceSizing::derive(&config).unwrap()
    }

    #[test]
    fn test_stage_params_layout() {
        assert_eq!(STAGE_PARAMS_SIZE, 32);
        let args = DispatchArgs {
            edge_offset: 2048,
            edge_count: 2048,
            side: 1,
            selection: EdgeSelection::Alive,
            filter: FilterMode::ClearTrimmed,
            stride: 1500,
        };
        let words: [u32; 8] = bytemuck::cast(StageParams::from(&args));
        assert_eq!(words, [2048, 2048, 1, 1, 1, 1500, 0, 0]);
    }

    #[test]
    fn test_source_is_prefixed_with_constants() {
        let s = sizing();
        let limits = DeviceLimits {
            max_work_group_size: 256,
            local_memory_bytes: 32 * 1024,
            max_work_groups_per_dimension: 65535,
        };
        let sizes = WorkGroupSizes::derive(&limits, &s);
        let source = shader_source(&s, &sizes, s.buckets_one_words());
        assert!(source.starts_with("const EDGE_BITS: u32 = 12u;"));
        assert!(source.contains("fn scatter_source("));
        for kernel in KernelId::ALL {
            assert!(source.contains(&format!("fn {}(", kernel.entry_point())));
            assert!(source.contains(&format!("@workgroup_size({})", kernel.work_group_constant())));
        }
    }

    #[test]
    fn test_dispatch_dimensions() {
        assert_eq!(dispatch_dimensions(10, 65535), (10, 1));
        assert_eq!(dispatch_dimensions(70000, 65535), (65535, 2));
        assert_eq!(dispatch_dimensions(0, 65535), (0, 1));
    }

    #[tokio::test]
    #[serial]
    async fn test_kernels_build_on_device() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_kernels_build_on_device: GPU not available");
            return;
        }

        let device = GpuDevice::new().await.unwrap();
        let s = sizing();
        let pipelines = TrimmingPipelines::build(&device, &s, s.buckets_one_words())
            .await
            .unwrap();
        assert!(pipelines.sizes().get(KernelId::MarkSource).is_power_of_two());
    }
}
