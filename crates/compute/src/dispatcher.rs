//! The GPU-submission thread.
//!
//! Host code never touches the device directly. It snapshots the current
//! [`TriggerParams`] and hands them to a [`WorkQueue`]; the worker thread owned
//! by the [`Dispatcher`] records and executes one [`PassGraph`] per trigger,
//! then consumes readbacks in trigger order according to the
//! [`ReadbackPolicy`]. A dispatch without a readback is reported once its
//! submission has retired, so every submitted graph runs before shutdown.

use crate::config::{DispatchConfig, ReadbackPolicy};
use crate::kernel::{KernelBinding, KernelRegistry, SCALE_KERNEL_ENTRY};
use crate::layout::{PassParameters, ScaleParameters};
use crate::{BufferInit, ComputeBackend, ComputeError, PassGraph, ReadbackHandle, ReadbackState, SubmissionIndex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Values captured from host state at trigger time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerParams {
    pub multiplier: f32,
    pub element_count: u32,
}

impl From<&DispatchConfig> for TriggerParams {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            multiplier: config.multiplier,
            element_count: config.element_count,
        }
    }
}

/// Result of one triggered dispatch, delivered in trigger order.
#[derive(Debug)]
pub struct DispatchReport {
    pub sequence: u64,
    pub params: TriggerParams,
    pub group_count: [u32; 3],
    /// `None` when the graph never reached the backend.
    pub submission: Option<SubmissionIndex>,
    /// The read-back data, `None` when readback is disabled.
    pub outcome: Result<Option<Vec<f32>>, ComputeError>,
}

#[derive(Debug)]
enum WorkItem {
    Dispatch { sequence: u64, params: TriggerParams },
    ReloadShaders,
    Shutdown,
}

/// Cloneable entry point to the submission thread.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: Sender<WorkItem>,
    sequence: Arc<AtomicU64>,
}

impl WorkQueue {
    /// Enqueues one dispatch with a snapshot of `params`.
    pub fn trigger(&self, params: TriggerParams) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Trigger {sequence}: multiplier {}, {} element(s)",
            params.multiplier,
            params.element_count
        );
        if self.sender.send(WorkItem::Dispatch { sequence, params }).is_err() {
            tracing::error!("Dropping trigger {sequence}: {}", ComputeError::QueueClosed);
        }
    }

    /// Asks the worker to rebuild pipelines from source before the next dispatch.
    pub fn reload_shaders(&self) {
        if self.sender.send(WorkItem::ReloadShaders).is_err() {
            tracing::error!("Dropping shader reload: {}", ComputeError::QueueClosed);
        }
    }
}

/// Owns the submission thread. Dropping it drains outstanding work.
pub struct Dispatcher {
    queue: WorkQueue,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts the submission thread for the registry's scale kernel.
    ///
    /// # Errors
    ///
    /// Fails if the registry has no scale kernel, the kernel is not compiled
    /// for the backend's feature level, or the thread cannot be started.
    pub fn spawn(
        backend: Arc<dyn ComputeBackend>,
        registry: &KernelRegistry,
        config: DispatchConfig,
        reports: Option<Sender<DispatchReport>>,
    ) -> Result<Self, ComputeError> {
        let kernel = registry
            .scale_kernel()
            .cloned()
            .ok_or_else(|| ComputeError::MissingKernel(SCALE_KERNEL_ENTRY.to_owned()))?;
        let level = backend.feature_level();
        if !kernel.supports(level) {
            return Err(ComputeError::KernelUnsupported {
                entry_point: kernel.entry_point().to_owned(),
                level,
            });
        }

        let (sender, receiver) = mpsc::channel();
        tracing::info!(
            "Starting submission thread on {} ({:?} readback, poll every {} ms)",
            backend.name(),
            config.readback_policy,
            config.poll_interval_ms
        );
        let worker = Worker {
            backend,
            kernel,
            config,
            reports,
            pending: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name("cloth-compute-submit".into())
            .spawn(move || worker.run(&receiver))
            .map_err(ComputeError::WorkerSpawn)?;

        Ok(Self {
            queue: WorkQueue {
                sender,
                sequence: Arc::new(AtomicU64::new(0)),
            },
            worker: Some(handle),
        })
    }

    #[must_use]
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub fn trigger(&self, params: TriggerParams) {
        self.queue.trigger(params);
    }

    pub fn reload_shaders(&self) {
        self.queue.reload_shaders();
    }

    /// Drains outstanding dispatches and joins the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        // A send error means the worker already exited.
        let _ = self.queue.sender.send(WorkItem::Shutdown);
        if handle.join().is_err() {
            tracing::error!("Submission thread panicked");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

struct InFlight {
    report: DispatchReport,
    readback: Option<ReadbackHandle>,
}

struct Worker {
    backend: Arc<dyn ComputeBackend>,
    kernel: KernelBinding,
    config: DispatchConfig,
    reports: Option<Sender<DispatchReport>>,
    pending: VecDeque<InFlight>,
}

impl Worker {
    fn run(mut self, receiver: &Receiver<WorkItem>) {
        let tick = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let item = if self.pending.is_empty() {
                receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                receiver.recv_timeout(tick)
            };
            match item {
                Ok(WorkItem::Dispatch { sequence, params }) => {
                    let in_flight = self.dispatch(sequence, params);
                    self.pending.push_back(in_flight);
                    if self.config.readback_policy == ReadbackPolicy::Blocking {
                        self.wait_idle();
                    }
                }
                Ok(WorkItem::ReloadShaders) => {
                    tracing::info!("Reloading shaders on {}", self.backend.name());
                    self.backend.invalidate_pipelines();
                }
                Ok(WorkItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.poll_pending();
        }
        self.drain();
    }

    fn dispatch(&self, sequence: u64, params: TriggerParams) -> InFlight {
        let group_count = self.kernel.group_count_for(params.element_count);
        let mut report = DispatchReport {
            sequence,
            params,
            group_count,
            submission: None,
            outcome: Ok(None),
        };
        tracing::debug!(
            "Dispatch {sequence}: {} x {:?} over {:?} group(s)",
            self.kernel.entry_point(),
            self.kernel.workgroup_size(),
            group_count
        );

        let readback = match self.record(sequence, params, group_count) {
            Ok((graph, readback)) => match graph.execute() {
                Ok(index) => {
                    report.submission = Some(index);
                    readback
                }
                Err(e) => {
                    report.outcome = Err(e);
                    None
                }
            },
            Err(e) => {
                report.outcome = Err(e);
                None
            }
        };
        if let Err(e) = &report.outcome {
            tracing::error!("Dispatch {sequence} failed: {e}");
        }
        InFlight { report, readback }
    }

    fn record(
        &self,
        sequence: u64,
        params: TriggerParams,
        group_count: [u32; 3],
    ) -> Result<(PassGraph, Option<ReadbackHandle>), ComputeError> {
        let mut graph = PassGraph::new(Arc::clone(&self.backend), format!("ClothCompute{sequence}"));
        let data = graph.create_buffer("ClothData", BufferInit::Fill(self.config.fill_value), params.element_count)?;
        let parameters = PassParameters::new(ScaleParameters::new(params.multiplier, params.element_count), data);
        graph.add_compute_pass("ScaleClothData", &self.kernel, &parameters, group_count)?;
        let readback = if self.config.readback {
            Some(graph.request_readback("ClothData", &data, data.size_bytes())?)
        } else {
            None
        };
        Ok((graph, readback))
    }

    fn wait_idle(&self) {
        if let Err(e) = self.backend.wait_idle() {
            tracing::error!("Waiting for {} failed: {e}", self.backend.name());
        }
    }

    /// Reports finished dispatches from the front of the queue. Stops at the
    /// first one still in flight so reports stay in trigger order.
    fn poll_pending(&mut self) {
        while let Some(front) = self.pending.front() {
            if !self.is_finished(front) {
                return;
            }
            if let Some(in_flight) = self.pending.pop_front() {
                self.finish(in_flight);
            }
        }
    }

    /// Lets the device progress and checks whether `in_flight` is done.
    fn is_finished(&self, in_flight: &InFlight) -> bool {
        match (&in_flight.readback, in_flight.report.submission) {
            (Some(readback), _) => readback.is_ready() || readback.state() != ReadbackState::Pending,
            (None, Some(index)) => {
                if !self.backend.is_retired(index) {
                    if let Err(e) = self.backend.poll() {
                        tracing::error!("Polling {} failed: {e}", self.backend.name());
                    }
                }
                self.backend.is_retired(index)
            }
            (None, None) => true,
        }
    }

    fn finish(&self, in_flight: InFlight) {
        let InFlight { mut report, readback } = in_flight;
        if let Some(readback) = readback {
            report.outcome = readback
                .lock(readback.size_bytes())
                .map(|view| Some(view.values::<f32>()));
            readback.release();
        }
        match &report.outcome {
            Ok(Some(values)) => {
                let preview = &values[..values.len().min(self.config.preview_count)];
                tracing::info!("Dispatch {} read back {} value(s): {preview:?}", report.sequence, values.len());
            }
            Ok(None) => tracing::debug!("Dispatch {} retired without readback", report.sequence),
            Err(e) => tracing::warn!("Dispatch {} has no result: {e}", report.sequence),
        }
        if let Some(reports) = &self.reports {
            // The receiver may have gone away; results are already logged.
            let _ = reports.send(report);
        }
    }

    fn drain(&mut self) {
        if !self.pending.is_empty() {
            tracing::info!("Draining {} outstanding dispatch(es)", self.pending.len());
            self.wait_idle();
            self.poll_pending();
        }
        while let Some(in_flight) = self.pending.pop_front() {
            self.finish(in_flight);
        }
        tracing::info!("Submission thread stopped");
    }
}
