//! wgpu implementation of [`ComputeBackend`]
//!
//! One command encoder per job. Clears are recorded as `clear_buffer`
//! commands, every dispatch gets its own compute pass with the slot's bind
//! group and the stage params at their dynamic offset. `submit` appends the
//! copy of the survival bitmap to the slot's readback buffer and requests the
//! map; `wait` polls the device up to that submission.
//!
//! When the device supports timestamp queries, the first compute pass of a job
//! writes a start timestamp and the last one an end timestamp. Both are
//! resolved and read back with the bitmap.

use std::time::Duration;

use futures_intrusive::channel::shared::{oneshot_channel, OneshotReceiver};
use tracing::{debug, error, info};

use super::buffer::TrimmingBuffers;
use super::memory::GpuMemoryLimits;
use super::pipeline::{dispatch_dimensions, StageParams, TrimmingPipelines, STAGE_PARAMS_SIZE};
use super::GpuDevice;
use crate::backend::{BitmapSlot, ComputeBackend};
use crate::error::{Result, TrimError};
use crate::plan::{JobPlan, Stage};
use crate::siphash::SipHashKeys;
use crate::sizing::ResourceSizing;

type MapResult = std::result::Result<(), wgpu::BufferAsyncError>;

// begin and end tick
const TIMESTAMP_BYTES: u64 = 16;

/// Handle to a submitted job
pub struct WgpuSubmission {
    slot: BitmapSlot,
    index: wgpu::SubmissionIndex,
    mapped: OneshotReceiver<MapResult>,
    timestamps: Option<OneshotReceiver<MapResult>>,
}

struct ParamsTable {
    // kept alive for the bind group
    _buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    stride: u64,
    last_dispatch: usize,
}

/// Per-slot timestamp queries around a job's compute passes
struct JobTimer {
    query_sets: [wgpu::QuerySet; 2],
    resolved: [wgpu::Buffer; 2],
    readback: [wgpu::Buffer; 2],
    period_ns: f64,
}

impl JobTimer {
    fn new(device: &GpuDevice) -> Option<Self> {
        if !device.supports_timestamps() {
            return None;
        }
        let query_set = |label: &str| {
            device.device().create_query_set(&wgpu::QuerySetDescriptor {
                label: Some(label),
                ty: wgpu::QueryType::Timestamp,
                count: 2,
            })
        };
        let resolve = wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC;
        let readback = wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
        Some(Self {
            query_sets: [query_set("Job Timestamps One"), query_set("Job Timestamps Two")],
            resolved: [
                device.create_buffer("Job Timestamps Resolve One", TIMESTAMP_BYTES, resolve),
                device.create_buffer("Job Timestamps Resolve Two", TIMESTAMP_BYTES, resolve),
            ],
            readback: [
                device.create_buffer("Job Timestamps Readback One", TIMESTAMP_BYTES, readback),
                device.create_buffer("Job Timestamps Readback Two", TIMESTAMP_BYTES, readback),
            ],
            period_ns: f64::from(device.queue().get_timestamp_period()),
        })
    }

    fn pass_writes(
        &self,
        slot: BitmapSlot,
        first: bool,
        last: bool,
    ) -> Option<wgpu::ComputePassTimestampWrites<'_>> {
        (first || last).then(|| wgpu::ComputePassTimestampWrites {
            query_set: &self.query_sets[slot.index()],
            beginning_of_pass_write_index: first.then_some(0),
            end_of_pass_write_index: last.then_some(1),
        })
    }

    fn resolve(&self, encoder: &mut wgpu::CommandEncoder, slot: BitmapSlot) {
        let i = slot.index();
        encoder.resolve_query_set(&self.query_sets[i], 0..2, &self.resolved[i], 0);
        encoder.copy_buffer_to_buffer(&self.resolved[i], 0, &self.readback[i], 0, TIMESTAMP_BYTES);
    }

    fn request_map(&self, slot: BitmapSlot) -> OneshotReceiver<MapResult> {
        let (tx, rx) = oneshot_channel();
        self.readback[slot.index()]
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        rx
    }

    fn read(&self, slot: BitmapSlot) -> Duration {
        let readback = &self.readback[slot.index()];
        let view = readback.slice(..).get_mapped_range();
        let begin: u64 = bytemuck::pod_read_unaligned(&view[..8]);
        let end: u64 = bytemuck::pod_read_unaligned(&view[8..16]);
        drop(view);
        readback.unmap();
        ticks_to_duration(begin, end, self.period_ns)
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn ticks_to_duration(begin: u64, end: u64, period_ns: f64) -> Duration {
    Duration::from_nanos((end.saturating_sub(begin) as f64 * period_ns) as u64)
}

async fn receive_map(receiver: OneshotReceiver<MapResult>) -> Result<()> {
    receiver
        .receive()
        .await
        .ok_or_else(|| TrimError::Map("map callback was dropped".to_string()))?
        .map_err(|e| TrimError::Map(e.to_string()))
}

/// Slean trimming on a wgpu device
pub struct WgpuBackend {
    device: GpuDevice,
    name: String,
    sizing: ResourceSizing,
    pipelines: TrimmingPipelines,
    buffers: TrimmingBuffers,
    slot_groups: [wgpu::BindGroup; 2],
    timer: Option<JobTimer>,
    params: Option<ParamsTable>,
    recording: Option<(BitmapSlot, wgpu::CommandEncoder)>,
    pending: [bool; 2],
    mapped: [bool; 2],
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("name", &self.name)
            .field("sizing", &self.sizing)
            .field("pending", &self.pending)
            .field("mapped", &self.mapped)
            .field("timestamps", &self.timer.is_some())
            .finish_non_exhaustive()
    }
}

impl WgpuBackend {
    /// Allocate buffers and build kernels for `sizing` on `device`
    ///
    /// # Errors
    ///
    /// [`TrimError::Allocation`] or [`TrimError::PipelineBuild`].
    pub async fn new(device: GpuDevice, sizing: ResourceSizing) -> Result<Self> {
        let limits = GpuMemoryLimits::detect(&device);
        let buffers = TrimmingBuffers::allocate(&device, &sizing, &limits).await?;
        let pipelines = TrimmingPipelines::build(&device, &sizing, buffers.split.first_words)
            .await
            .map_err(|e| {
                error!("Building program for the GPU failed: {e}");
                e
            })?;
        let slot_groups = BitmapSlot::BOTH
            .map(|slot| buffers.slot_bind_group(&device, pipelines.slot_layout(), slot));
        let name = device.name();
        let timer = JobTimer::new(&device);
        if timer.is_none() {
            info!("{name} has no timestamp queries, trimming time is host wall time only");
        }
        info!("Prepared slean trimming for {} edges on {name}", sizing.number_of_edges);

        Ok(Self {
            device,
            name,
            sizing,
            pipelines,
            buffers,
            slot_groups,
            timer,
            params: None,
            recording: None,
            pending: [false; 2],
            mapped: [false; 2],
        })
    }

    /// The device the backend runs on
    #[must_use]
    pub fn device(&self) -> &GpuDevice {
        &self.device
    }

    /// Final kernel pipelines
    #[must_use]
    pub fn pipelines(&self) -> &TrimmingPipelines {
        &self.pipelines
    }

    fn check_device(&self, failure: fn(String) -> TrimError) -> Result<()> {
        match self.device.take_device_error() {
            Some(message) => Err(failure(message)),
            None => Ok(()),
        }
    }
}

impl ComputeBackend for WgpuBackend {
    type Submission = WgpuSubmission;

    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, plan: &JobPlan) -> Result<()> {
        let alignment = u64::from(
            self.device
                .device()
                .limits()
                .min_uniform_buffer_offset_alignment,
        );
        let stride = STAGE_PARAMS_SIZE.next_multiple_of(alignment.max(1));
        let args = plan.dispatch_args();
        let chunk_len = usize::try_from(stride)
            .map_err(|_| TrimError::Allocation(format!("stage params stride {stride}")))?;
        let mut table = vec![0u8; chunk_len * args.len().max(1)];
        for (chunk, dispatch) in table.chunks_exact_mut(chunk_len).zip(args) {
            let params = StageParams::from(dispatch);
            chunk[..bytemuck::bytes_of(&params).len()].copy_from_slice(bytemuck::bytes_of(&params));
        }

        let buffer = self.device.create_buffer(
            "Slean Stage Params",
            table.len() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        self.device.queue().write_buffer(&buffer, 0, &table);
        let bind_group = self
            .device
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Slean Params Bind Group"),
                layout: self.pipelines.params_layout(),
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(STAGE_PARAMS_SIZE),
                    }),
                }],
            });
        self.check_device(TrimError::Allocation)?;

        debug!(
            "Uploaded {} stage params ({} bytes each)",
            args.len(),
            stride
        );
        self.params = Some(ParamsTable {
            _buffer: buffer,
            bind_group,
            stride,
            last_dispatch: plan.dispatch_count().saturating_sub(1),
        });
        Ok(())
    }

    fn begin_job(&mut self, slot: BitmapSlot, keys: &SipHashKeys) -> Result<()> {
        if self.recording.is_some() {
            return Err(TrimError::Dispatch("a job is already being recorded".to_string()));
        }
        if self.pending[slot.index()] || self.mapped[slot.index()] {
            return Err(TrimError::Map(format!("bitmap {slot:?} is still in use")));
        }
        self.device.queue().write_buffer(
            &self.buffers.keys[slot.index()],
            0,
            bytemuck::cast_slice(&keys.to_limbs()),
        );
        let encoder = self
            .device
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Slean Job Encoder"),
            });
        self.recording = Some((slot, encoder));
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn record(&mut self, stage: &Stage) -> Result<()> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| TrimError::Dispatch("stage params were never prepared".to_string()))?;
        let (slot, encoder) = self
            .recording
            .as_mut()
            .ok_or_else(|| TrimError::Dispatch("no job is being recorded".to_string()))?;

        match stage {
            Stage::Clear(target) => {
                encoder.clear_buffer(self.buffers.clear_target(*target, *slot), 0, None);
            }
            Stage::Dispatch(dispatch) => {
                let sizes = self.pipelines.sizes();
                let groups = sizes.work_groups(dispatch.kernel, &self.sizing, dispatch.args.edge_count);
                let (x, y) = dispatch_dimensions(
                    groups,
                    self.pipelines.limits().max_work_groups_per_dimension,
                );
                let offset = dispatch.args_index as u64 * params.stride;
                let timestamp_writes = self.timer.as_ref().and_then(|timer| {
                    timer.pass_writes(
                        *slot,
                        dispatch.args_index == 0,
                        dispatch.args_index == params.last_dispatch,
                    )
                });

                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(dispatch.kernel.entry_point()),
                    timestamp_writes,
                });
                pass.set_pipeline(self.pipelines.get(dispatch.kernel));
                pass.set_bind_group(0, &self.slot_groups[slot.index()], &[]);
                pass.set_bind_group(1, &params.bind_group, &[offset as u32]);
                pass.dispatch_workgroups(x, y, 1);
            }
        }
        Ok(())
    }

    fn submit(&mut self) -> Result<WgpuSubmission> {
        let (slot, mut encoder) = self
            .recording
            .take()
            .ok_or_else(|| TrimError::Dispatch("no job is being recorded".to_string()))?;
        let i = slot.index();
        encoder.copy_buffer_to_buffer(
            &self.buffers.survival[i],
            0,
            &self.buffers.readback[i],
            0,
            self.sizing.full_bitmap_bytes,
        );
        if let Some(timer) = &self.timer {
            timer.resolve(&mut encoder, slot);
        }
        let index = self.device.queue().submit(Some(encoder.finish()));

        let (tx, rx) = oneshot_channel();
        self.buffers.readback[i]
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        let timestamps = self.timer.as_ref().map(|timer| timer.request_map(slot));
        self.check_device(TrimError::Dispatch)?;
        self.pending[i] = true;

        Ok(WgpuSubmission {
            slot,
            index,
            mapped: rx,
            timestamps,
        })
    }

    async fn wait(&mut self, submission: WgpuSubmission) -> Result<Option<Duration>> {
        let WgpuSubmission {
            slot,
            index,
            mapped,
            timestamps,
        } = submission;
        self.device
            .device()
            .poll(wgpu::Maintain::wait_for(index));
        self.pending[slot.index()] = false;

        receive_map(mapped).await?;
        self.check_device(TrimError::Dispatch)?;
        self.mapped[slot.index()] = true;

        let device_time = match (timestamps, &self.timer) {
            (Some(receiver), Some(timer)) => {
                receive_map(receiver).await?;
                Some(timer.read(slot))
            }
            _ => None,
        };
        Ok(device_time)
    }

    fn read_bitmap<R>(&mut self, slot: BitmapSlot, read: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let i = slot.index();
        if !self.mapped[i] {
            return Err(TrimError::Map(format!("bitmap {slot:?} is not ready")));
        }
        let readback = &self.buffers.readback[i];
        let view = readback.slice(..).get_mapped_range();
        let result = read(&view);
        drop(view);
        readback.unmap();
        self.mapped[i] = false;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrimmingConfig;
    use crate::device::DeviceSelector;
    use crate::reference::trim_edges;
    use serial_test::serial;

    async fn backend(config: &TrimmingConfig) -> Option<(WgpuBackend, JobPlan)> {
        if !GpuDevice::is_gpu_available().await {
            return None;
        }
        let sizing = ResourceSizing::derive(config).unwrap();
        let device = GpuDevice::acquire(config, &sizing, DeviceSelector::First)
            .await
            .ok()?;
        let mut backend = WgpuBackend::new(device, sizing).await.unwrap();
        let plan = JobPlan::build(config, &sizing);
        backend.prepare(&plan).unwrap();
        Some((backend, plan))
    }

    async fn run(
        backend: &mut WgpuBackend,
        plan: &JobPlan,
        slot: BitmapSlot,
        keys: SipHashKeys,
    ) -> Vec<u8> {
        backend.begin_job(slot, &keys).unwrap();
        for (_, stage) in plan.stages() {
            backend.record(stage).unwrap();
        }
        let submission = backend.submit().unwrap();
        let device_time = backend.wait(submission).await.unwrap();
        assert_eq!(device_time.is_some(), backend.device().supports_timestamps());
        backend.read_bitmap(slot, <[u8]>::to_vec).unwrap()
    }

    #[test]
    fn test_ticks_to_duration() {
        assert_eq!(ticks_to_duration(1_000, 3_500, 1.0), Duration::from_nanos(2_500));
        assert_eq!(ticks_to_duration(0, 12, 83.0), Duration::from_nanos(996));
        // a reset counter reads as zero rather than wrapping
        assert_eq!(ticks_to_duration(9, 4, 1.0), Duration::ZERO);
    }

    #[tokio::test]
    #[serial]
    async fn test_gpu_matches_reference() {
        let config = TrimmingConfig::new(14)
            .with_parts(4)
            .with_local_ram_kb(32)
            .with_trimming_rounds(8);
        let Some((mut gpu, plan)) = backend(&config).await else {
            eprintln!("⚠️  Skipping test_gpu_matches_reference: GPU not available");
            return;
        };

        let keys = SipHashKeys([2, 7, 1, 8]);
        let bitmap = run(&mut gpu, &plan, BitmapSlot::One, keys).await;
        assert_eq!(bitmap, trim_edges(&keys, 14, 8).to_bytes());
    }

    #[tokio::test]
    #[serial]
    async fn test_gpu_two_jobs_in_flight() {
        let config = TrimmingConfig::new(12)
            .with_parts(2)
            .with_local_ram_kb(32)
            .with_trimming_rounds(4);
        let Some((mut gpu, plan)) = backend(&config).await else {
            eprintln!("⚠️  Skipping test_gpu_two_jobs_in_flight: GPU not available");
            return;
        };

        let first = SipHashKeys([1, 2, 3, 4]);
        let second = SipHashKeys([5, 6, 7, 8]);
        let mut submissions = Vec::new();
        for (slot, keys) in [(BitmapSlot::One, first), (BitmapSlot::Two, second)] {
            gpu.begin_job(slot, &keys).unwrap();
            for (_, stage) in plan.stages() {
                gpu.record(stage).unwrap();
            }
            submissions.push(gpu.submit().unwrap());
        }
        assert!(gpu.begin_job(BitmapSlot::One, &first).is_err());

        let mut results = Vec::new();
        for submission in submissions {
            let slot = submission.slot;
            gpu.wait(submission).await.unwrap();
            results.push(gpu.read_bitmap(slot, <[u8]>::to_vec).unwrap());
        }
        assert_eq!(results[0], trim_edges(&first, 12, 4).to_bytes());
        assert_eq!(results[1], trim_edges(&second, 12, 4).to_bytes());
    }
}
