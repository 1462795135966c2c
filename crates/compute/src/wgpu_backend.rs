//! GPU implementation of [`ComputeBackend`] built on [`wgpu`].
//!
//! Kernels are compiled from the WGSL file their binding resolves to, one
//! pipeline per kernel, and cached until [`invalidate_pipelines`] is called.
//! Every submission is recorded into a single command encoder. Copy passes
//! land in staging buffers that are mapped asynchronously; `poll` and
//! `wait_idle` drive the device and move finished mappings into their
//! readback slots.
//!
//! Buffer creation and encoding run inside out-of-memory and validation
//! error scopes; a submission that trips either never reaches the queue.
//!
//! [`invalidate_pipelines`]: ComputeBackend::invalidate_pipelines

use crate::graph::{ComputePass, CopyPass, Pass};
use crate::kernel::KernelBinding;
use crate::layout::{BINDING_COUNT, STORAGE_DATA, UNIFORM_PARAMS};
use crate::readback::ReadbackSlot;
use crate::{ComputeBackend, ComputeError, FeatureLevel, Submission, SubmissionIndex};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wgpu::util::DeviceExt;

struct CachedPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

type MapResult = Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>>;

/// A copy destination waiting for its staging buffer to map.
struct StagedReadback {
    submission: SubmissionIndex,
    staging: wgpu::Buffer,
    size_bytes: u64,
    slot: Arc<ReadbackSlot>,
    mapped: MapResult,
}

/// Device objects recorded for one submission, ready to be queued.
struct Encoded<'a> {
    encoder: wgpu::CommandEncoder,
    staged: Vec<(wgpu::Buffer, &'a CopyPass)>,
    _buffers: Vec<wgpu::Buffer>,
}

/// GPU-backed implementation of [`ComputeBackend`] built on `wgpu`.
pub struct WgpuBackend {
    adapter_info: wgpu::AdapterInfo,
    feature_level: FeatureLevel,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Mutex<HashMap<usize, Arc<CachedPipeline>>>,
    in_flight: Mutex<VecDeque<StagedReadback>>,
    next_index: AtomicU64,
    /// Number of submissions the queue has reported done.
    retired: Arc<AtomicU64>,
}

impl WgpuBackend {
    /// Opens the system's default high-performance adapter.
    ///
    /// # Errors
    ///
    /// [`ComputeError::BackendUnavailable`] if no adapter or device can be created.
    pub fn try_new() -> Result<Self, ComputeError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or(ComputeError::BackendUnavailable)?;

        let adapter_info = adapter.get_info();
        let feature_level = feature_level_of(&adapter, &adapter_info);
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("ClothCompute"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))
        .map_err(|e| {
            tracing::warn!("Device request on {} failed: {e}", adapter_info.name);
            ComputeError::BackendUnavailable
        })?;

        tracing::debug!(
            "wgpu device on {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.backend,
            feature_level
        );
        Ok(Self {
            adapter_info,
            feature_level,
            device,
            queue,
            pipelines: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(VecDeque::new()),
            next_index: AtomicU64::new(0),
            retired: Arc::new(AtomicU64::new(0)),
        })
    }

    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_info.name
    }

    fn pipeline(&self, kernel: &KernelBinding) -> Result<Arc<CachedPipeline>, ComputeError> {
        let mut pipelines = self.pipelines.lock();
        if let Some(cached) = pipelines.get(&kernel.id()) {
            return Ok(Arc::clone(cached));
        }
        let built = Arc::new(self.build_pipeline(kernel)?);
        pipelines.insert(kernel.id(), Arc::clone(&built));
        Ok(built)
    }

    fn build_pipeline(&self, kernel: &KernelBinding) -> Result<CachedPipeline, ComputeError> {
        let path = kernel.source_path();
        let source = std::fs::read_to_string(path).map_err(|source| ComputeError::ShaderSource {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Compiling {} from {}", kernel.entry_point(), path.display());

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.virtual_path()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..BINDING_COUNT)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: if binding == UNIFORM_PARAMS {
                        wgpu::BufferBindingType::Uniform
                    } else {
                        wgpu::BufferBindingType::Storage { read_only: false }
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ClothCompute bind group layout"),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ClothCompute pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.entry_point()),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: kernel.entry_point(),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::PipelineCreation(format!("{}: {error}", kernel.entry_point())));
        }
        Ok(CachedPipeline { pipeline, layout })
    }

    fn encode_compute(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &ComputePass,
        buffers: &[wgpu::Buffer],
    ) -> Result<(), ComputeError> {
        let cached = self.pipeline(&pass.kernel)?;
        let data = buffers.get(pass.data.handle.index()).ok_or(ComputeError::ForeignBuffer)?;
        let uniforms = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&pass.label),
            contents: &pass.uniforms,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&pass.label),
            layout: &cached.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: UNIFORM_PARAMS,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: STORAGE_DATA,
                    resource: data.as_entire_binding(),
                },
            ],
        });

        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(&pass.label),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&cached.pipeline);
        cpass.set_bind_group(0, &bind_group, &[]);
        let [x, y, z] = pass.group_count;
        cpass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn encode_copy(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &CopyPass,
        buffers: &[wgpu::Buffer],
    ) -> Result<wgpu::Buffer, ComputeError> {
        let source = buffers.get(pass.source.handle.index()).ok_or(ComputeError::ForeignBuffer)?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&pass.label),
            size: pass.size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, pass.size_bytes);
        Ok(staging)
    }

    /// Uploads the buffers and records every pass into one encoder.
    fn encode<'a>(&self, submission: &'a Submission) -> Result<Encoded<'a>, ComputeError> {
        let limits = self.device.limits();
        let mut buffers = Vec::with_capacity(submission.buffers.len());
        for view in &submission.buffers {
            view.validate()?;
            let size_bytes = view.data.len() as u64;
            if size_bytes > self.max_buffer_size() {
                return Err(ComputeError::Allocation {
                    name: view.name.clone(),
                    size_bytes,
                });
            }
            buffers.push(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&view.name),
                contents: &view.data,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            }));
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&submission.label),
        });
        let mut staged = Vec::new();
        for pass in &submission.passes {
            match pass {
                Pass::Compute(p) => self.encode_compute(&mut encoder, p, &buffers)?,
                Pass::Copy(p) => {
                    if p.size_bytes > limits.max_buffer_size {
                        return Err(ComputeError::Allocation {
                            name: p.label.clone(),
                            size_bytes: p.size_bytes,
                        });
                    }
                    staged.push((self.encode_copy(&mut encoder, p, &buffers)?, p));
                }
            }
        }
        Ok(Encoded {
            encoder,
            staged,
            _buffers: buffers,
        })
    }

    /// Moves every finished mapping into its slot, oldest first.
    fn harvest(&self) {
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|staged| {
            let Some(result) = staged.mapped.lock().take() else {
                return true;
            };
            match result {
                Ok(()) => {
                    let bytes = staged.staging.slice(..staged.size_bytes).get_mapped_range().to_vec();
                    staged.staging.unmap();
                    staged.slot.complete(bytes);
                }
                Err(e) => {
                    tracing::error!(
                        "Mapping readback {} of submission {} failed: {e}",
                        staged.slot.name(),
                        staged.submission.0
                    );
                    staged.slot.fail();
                }
            }
            false
        });
    }
}

fn feature_level_of(adapter: &wgpu::Adapter, info: &wgpu::AdapterInfo) -> FeatureLevel {
    if info.backend == wgpu::Backend::Gl || !adapter.get_downlevel_capabilities().is_webgpu_compliant() {
        FeatureLevel::Es31
    } else if info.backend == wgpu::Backend::Dx12 {
        FeatureLevel::Sm6
    } else {
        FeatureLevel::Sm5
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    fn max_buffer_size(&self) -> u64 {
        let limits = self.device.limits();
        limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size))
    }

    fn submit(&self, submission: Submission) -> Result<SubmissionIndex, ComputeError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let encoded = self.encode(&submission);
        // Scopes pop in reverse order of pushing.
        let invalid = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(error) = out_of_memory {
            tracing::error!("wgpu: out of memory recording {}: {error}", submission.label);
            return Err(ComputeError::Allocation {
                name: submission.label.clone(),
                size_bytes: submission.buffers.iter().map(|view| view.data.len() as u64).sum(),
            });
        }
        if let Some(error) = invalid {
            return Err(ComputeError::DeviceRejected {
                label: submission.label.clone(),
                message: error.to_string(),
            });
        }
        let Encoded {
            encoder,
            staged,
            _buffers,
        } = encoded?;

        // Index and queue order must agree, so both advance under the in-flight lock.
        let mut in_flight = self.in_flight.lock();
        let index = SubmissionIndex(self.next_index.fetch_add(1, Ordering::AcqRel));
        self.queue.submit(Some(encoder.finish()));
        let retired = Arc::clone(&self.retired);
        self.queue.on_submitted_work_done(move || {
            retired.fetch_max(index.0 + 1, Ordering::AcqRel);
        });
        for (staging, pass) in staged {
            let mapped: MapResult = Arc::new(Mutex::new(None));
            let on_mapped = Arc::clone(&mapped);
            staging
                .slice(..pass.size_bytes)
                .map_async(wgpu::MapMode::Read, move |result| {
                    *on_mapped.lock() = Some(result);
                });
            in_flight.push_back(StagedReadback {
                submission: index,
                staging,
                size_bytes: pass.size_bytes,
                slot: Arc::clone(&pass.destination),
                mapped,
            });
        }
        tracing::trace!("wgpu: submitted {} as {}", submission.label, index.0);
        Ok(index)
    }

    fn is_retired(&self, index: SubmissionIndex) -> bool {
        index.0 < self.retired.load(Ordering::Acquire)
    }

    fn poll(&self) -> Result<(), ComputeError> {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.harvest();
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), ComputeError> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        self.harvest();
        Ok(())
    }

    fn invalidate_pipelines(&self) {
        let mut pipelines = self.pipelines.lock();
        tracing::info!("Dropping {} cached pipeline(s)", pipelines.len());
        pipelines.clear();
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter_info.name)
            .field("backend", &self.adapter_info.backend)
            .field("feature_level", &self.feature_level)
            .finish_non_exhaustive()
    }
}
