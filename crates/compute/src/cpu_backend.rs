//! Deterministic reference device.
//!
//! Submissions queue in FIFO order and only run when the host lets the
//! device make progress: [`poll`](ComputeBackend::poll) retires at most one
//! submission, [`wait_idle`](ComputeBackend::wait_idle) retires all of them.
//! Compute passes invoke the registered CPU kernel once per thread of every
//! group, so a partially filled last group behaves as it would on a GPU.
//!
//! Retirement is serialized: a submission is popped and run under one lock,
//! so `wait_idle` cannot return while another thread's `poll` is mid-run.

use crate::graph::{ComputePass, CopyPass, Pass};
use crate::kernels::{self, CpuKernel};
use crate::{
    ComputeBackend, ComputeError, FeatureLevel, Submission, SubmissionIndex, DEFAULT_MAX_BUFFER_SIZE,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct CpuBackend {
    feature_level: FeatureLevel,
    kernels: HashMap<String, CpuKernel>,
    max_buffer_size: u64,
    queue: Mutex<VecDeque<(SubmissionIndex, Submission)>>,
    run_lock: Mutex<()>,
    next_index: AtomicU64,
    retired: AtomicU64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// An SM5 device with the built-in kernels.
    #[must_use]
    pub fn new() -> Self {
        Self::with_feature_level(FeatureLevel::Sm5)
    }

    #[must_use]
    pub fn with_feature_level(feature_level: FeatureLevel) -> Self {
        let mut backend = Self::empty();
        backend.feature_level = feature_level;
        for (entry_point, kernel) in kernels::builtin() {
            backend.kernels.insert(entry_point.to_owned(), kernel);
        }
        backend
    }

    /// An SM5 device without any kernels.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            feature_level: FeatureLevel::Sm5,
            kernels: HashMap::new(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            queue: Mutex::new(VecDeque::new()),
            run_lock: Mutex::new(()),
            next_index: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        }
    }

    /// Adds or replaces the implementation of `entry_point`.
    #[must_use]
    pub fn with_kernel(mut self, entry_point: &str, kernel: CpuKernel) -> Self {
        self.kernels.insert(entry_point.to_owned(), kernel);
        self
    }

    #[must_use]
    pub fn with_max_buffer_size(mut self, bytes: u64) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Submissions queued but not yet retired.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Submissions retired so far.
    #[must_use]
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Acquire)
    }

    fn validate(&self, submission: &Submission) -> Result<(), ComputeError> {
        for view in &submission.buffers {
            view.validate()?;
            let size_bytes = view.data.len() as u64;
            if size_bytes > self.max_buffer_size {
                return Err(ComputeError::Allocation {
                    name: view.name.clone(),
                    size_bytes,
                });
            }
            if view.element_size_in_bytes % 4 != 0 {
                return Err(ComputeError::MisalignedStride(view.element_size_in_bytes));
            }
        }
        for pass in &submission.passes {
            let buffer = match pass {
                Pass::Compute(p) => {
                    if !self.kernels.contains_key(p.kernel.entry_point()) {
                        return Err(ComputeError::MissingKernel(p.kernel.entry_point().to_owned()));
                    }
                    p.data.handle.index()
                }
                Pass::Copy(p) => p.source.handle.index(),
            };
            if buffer >= submission.buffers.len() {
                return Err(ComputeError::ForeignBuffer);
            }
        }
        Ok(())
    }

    /// Runs the oldest queued submission while holding the run lock.
    /// Returns `false` when the queue is empty.
    fn retire_next(&self, _running: &parking_lot::MutexGuard<'_, ()>) -> bool {
        let Some((index, submission)) = self.queue.lock().pop_front() else {
            return false;
        };
        self.run(index, submission);
        self.retired.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn run(&self, index: SubmissionIndex, submission: Submission) {
        tracing::trace!("cpu: running submission {} ({})", index.0, submission.label);
        let mut memory = match load_memory(&submission) {
            Ok(memory) => memory,
            Err(e) => {
                tracing::error!("cpu: submission {} ({}) dropped: {e}", index.0, submission.label);
                for pass in &submission.passes {
                    if let Pass::Copy(p) = pass {
                        p.destination.fail();
                    }
                }
                return;
            }
        };

        for pass in &submission.passes {
            match pass {
                Pass::Compute(p) => self.run_compute(p, &mut memory),
                Pass::Copy(p) => run_copy(p, &memory),
            }
        }
    }

    fn run_compute(&self, pass: &ComputePass, memory: &mut [Vec<u32>]) {
        let Some(kernel) = self.kernels.get(pass.kernel.entry_point()) else {
            return;
        };
        let Some(data) = memory.get_mut(pass.data.handle.index()) else {
            return;
        };
        let size = pass.kernel.workgroup_size();
        let extent = [
            pass.group_count[0].saturating_mul(size[0]),
            pass.group_count[1].saturating_mul(size[1]),
            pass.group_count[2].saturating_mul(size[2]),
        ];
        for z in 0..extent[2] {
            for y in 0..extent[1] {
                for x in 0..extent[0] {
                    kernel(&pass.uniforms, data, [x, y, z]);
                }
            }
        }
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("feature_level", &self.feature_level)
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("pending", &self.pending())
            .field("retired", &self.retired())
            .finish()
    }
}

/// Device memory for every buffer in the submission, one word per 4 bytes.
fn load_memory(submission: &Submission) -> Result<Vec<Vec<u32>>, ComputeError> {
    let mut memory = Vec::new();
    memory
        .try_reserve_exact(submission.buffers.len())
        .map_err(|_| ComputeError::Allocation {
            name: submission.label.clone(),
            size_bytes: submission.buffers.iter().map(|view| view.data.len() as u64).sum(),
        })?;
    for view in &submission.buffers {
        let mut words = Vec::new();
        words
            .try_reserve_exact(view.data.len() / 4)
            .map_err(|_| ComputeError::Allocation {
                name: view.name.clone(),
                size_bytes: view.data.len() as u64,
            })?;
        words.extend(
            view.data
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
        );
        memory.push(words);
    }
    Ok(memory)
}

fn run_copy(pass: &CopyPass, memory: &[Vec<u32>]) {
    let Some(words) = memory.get(pass.source.handle.index()) else {
        pass.destination.fail();
        return;
    };
    let bytes: &[u8] = bytemuck::cast_slice(words);
    match usize::try_from(pass.size_bytes).ok().and_then(|len| bytes.get(..len)) {
        Some(range) => pass.destination.complete(range.to_vec()),
        None => pass.destination.fail(),
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }

    fn submit(&self, submission: Submission) -> Result<SubmissionIndex, ComputeError> {
        self.validate(&submission)?;
        let mut queue = self.queue.lock();
        let index = SubmissionIndex(self.next_index.fetch_add(1, Ordering::AcqRel));
        tracing::trace!("cpu: queued submission {} ({})", index.0, submission.label);
        queue.push_back((index, submission));
        Ok(index)
    }

    fn poll(&self) -> Result<(), ComputeError> {
        // Held means another thread is mid-run; that run counts as progress.
        if let Some(running) = self.run_lock.try_lock() {
            self.retire_next(&running);
        }
        Ok(())
    }

    fn is_retired(&self, index: SubmissionIndex) -> bool {
        index.0 < self.retired()
    }

    fn wait_idle(&self) -> Result<(), ComputeError> {
        let running = self.run_lock.lock();
        while self.retire_next(&running) {}
        Ok(())
    }
}
