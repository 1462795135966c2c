//! Single-use pass graphs.
//!
//! A [`PassGraph`] records buffer uploads, compute passes and copy passes in
//! call order. Passes run in that order; the graph never reorders them. Each
//! pass carries the indices of earlier passes it depends on through a shared
//! buffer, so a backend may overlap passes that touch disjoint buffers.
//!
//! [`PassGraph::execute`] consumes the graph and submits everything as one
//! unit, which makes appending to an executed graph a compile error:
//!
//! ```compile_fail
//! use compute::{BufferInit, CpuBackend, PassGraph};
//! use std::sync::Arc;
//!
//! let mut graph = PassGraph::new(Arc::new(CpuBackend::new()), "once");
//! let buffer = graph.create_buffer("data", BufferInit::default(), 4).unwrap();
//! graph.execute().unwrap();
//! let late = graph.request_readback("late", &buffer, 16);
//! ```

use crate::buffer::{BufferView, GpuBuffer};
use crate::kernel::KernelBinding;
use crate::layout::PassParameters;
use crate::readback::{ReadbackHandle, ReadbackSlot};
use crate::{ComputeBackend, ComputeError, SubmissionIndex};
use bytemuck::Pod;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Unique per graph instance; buffer handles carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl GraphId {
    fn next() -> Self {
        Self(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PassIndex(pub usize);

#[derive(Debug, Clone)]
pub struct ComputePass {
    pub label: String,
    pub kernel: KernelBinding,
    pub uniforms: Arc<[u8]>,
    pub data: GpuBuffer,
    pub group_count: [u32; 3],
    pub dependencies: Vec<PassIndex>,
}

#[derive(Debug, Clone)]
pub struct CopyPass {
    pub label: String,
    pub source: GpuBuffer,
    pub destination: Arc<ReadbackSlot>,
    pub size_bytes: u64,
    pub dependencies: Vec<PassIndex>,
}

#[derive(Debug, Clone)]
pub enum Pass {
    Compute(ComputePass),
    Copy(CopyPass),
}

impl Pass {
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Pass::Compute(p) => &p.label,
            Pass::Copy(p) => &p.label,
        }
    }

    #[must_use]
    pub fn dependencies(&self) -> &[PassIndex] {
        match self {
            Pass::Compute(p) => &p.dependencies,
            Pass::Copy(p) => &p.dependencies,
        }
    }
}

/// Everything a backend needs to run one executed graph.
#[derive(Debug)]
pub struct Submission {
    pub label: String,
    /// Initial contents, indexed by [`BufferHandle::index`](crate::BufferHandle::index).
    pub buffers: Vec<BufferView>,
    pub passes: Vec<Pass>,
}

/// Records GPU work for one dispatch.
///
/// ```
/// use compute::{startup, BufferInit, ComputeBackend, CpuBackend, PassGraph, PassParameters, ScaleParameters};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), compute::ComputeError> {
/// let registry = startup("shaders")?;
/// let kernel = registry.scale_kernel().unwrap();
/// let backend = Arc::new(CpuBackend::new());
///
/// let mut graph = PassGraph::new(backend.clone(), "example");
/// let data = graph.create_buffer("data", BufferInit::Fill(1.5), 8)?;
/// let params = PassParameters::new(ScaleParameters::new(2.0, 8), data);
/// graph.add_compute_pass("scale", kernel, &params, kernel.group_count_for(8))?;
/// let readback = graph.request_readback("result", &data, data.size_bytes())?;
/// graph.execute()?;
///
/// backend.wait_idle()?;
/// assert!(readback.is_ready());
/// assert_eq!(readback.lock(data.size_bytes())?.values::<f32>(), vec![3.0; 8]);
/// # Ok(())
/// # }
/// ```
pub struct PassGraph {
    pub(crate) id: GraphId,
    pub(crate) label: String,
    backend: Arc<dyn ComputeBackend>,
    pub(crate) buffers: Vec<BufferView>,
    last_writer: Vec<Option<PassIndex>>,
    readers_since_write: Vec<Vec<PassIndex>>,
    passes: Vec<Pass>,
    readbacks: Vec<Arc<ReadbackSlot>>,
}

impl PassGraph {
    pub fn new(backend: Arc<dyn ComputeBackend>, label: impl Into<String>) -> Self {
        let label = label.into();
        let id = GraphId::next();
        tracing::trace!("Begin graph {label} ({id:?}) on {}", backend.name());
        Self {
            id,
            label,
            backend,
            buffers: Vec::new(),
            last_writer: Vec::new(),
            readers_since_write: Vec::new(),
            passes: Vec::new(),
            readbacks: Vec::new(),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    #[must_use]
    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn dependencies(&self, pass: PassIndex) -> &[PassIndex] {
        self.passes.get(pass.0).map_or(&[][..], Pass::dependencies)
    }

    pub(crate) fn push_buffer(&mut self, view: BufferView) {
        self.buffers.push(view);
        self.last_writer.push(None);
        self.readers_since_write.push(Vec::new());
    }

    fn check_buffer(&self, buffer: &GpuBuffer) -> Result<(), ComputeError> {
        let known = buffer.handle.graph == self.id
            && self.buffers.get(buffer.handle.index()).is_some_and(|view| {
                view.element_count == buffer.element_count as usize
                    && view.element_size_in_bytes == buffer.element_stride as usize
            });
        if known {
            Ok(())
        } else {
            Err(ComputeError::ForeignBuffer)
        }
    }

    fn next_index(&self) -> PassIndex {
        PassIndex(self.passes.len())
    }

    /// Records a dispatch of `kernel` over `group_count` groups.
    ///
    /// The pass reads and writes `params.data`, so it depends on the last
    /// writer of that buffer and on every copy that read it since.
    ///
    /// # Errors
    ///
    /// Fails if the kernel is not compiled for the backend's feature level,
    /// the parameter block size differs from the registered one, the buffer
    /// belongs to another graph, or a group dimension is zero.
    pub fn add_compute_pass<P: Pod>(
        &mut self,
        label: &str,
        kernel: &KernelBinding,
        params: &PassParameters<P>,
        group_count: [u32; 3],
    ) -> Result<PassIndex, ComputeError> {
        let level = self.backend.feature_level();
        if !kernel.supports(level) {
            return Err(ComputeError::KernelUnsupported {
                entry_point: kernel.entry_point().to_owned(),
                level,
            });
        }
        let uniforms = params.uniform_bytes();
        if uniforms.len() != kernel.uniform_size() {
            return Err(ComputeError::ParameterLayout {
                entry_point: kernel.entry_point().to_owned(),
                expected: kernel.uniform_size(),
                actual: uniforms.len(),
            });
        }
        self.check_buffer(&params.data)?;
        if group_count.contains(&0) {
            return Err(ComputeError::ShapeMismatch("group count must be non-zero in every dimension"));
        }

        let index = self.next_index();
        let slot = params.data.handle.index();
        let mut dependencies: Vec<PassIndex> = self.last_writer[slot].into_iter().collect();
        dependencies.append(&mut self.readers_since_write[slot]);
        dependencies.sort_unstable();
        dependencies.dedup();
        self.last_writer[slot] = Some(index);

        tracing::trace!(
            "{}: compute pass {label} -> {} {:?} after {:?}",
            self.label,
            kernel.entry_point(),
            group_count,
            dependencies
        );
        self.passes.push(Pass::Compute(ComputePass {
            label: label.to_owned(),
            kernel: kernel.clone(),
            uniforms: uniforms.into(),
            data: params.data,
            group_count,
            dependencies,
        }));
        Ok(index)
    }

    /// Creates an empty readback of `size_bytes` bound to this graph's backend.
    #[must_use]
    pub fn create_readback(&self, name: &str, size_bytes: u64) -> ReadbackHandle {
        ReadbackHandle::new(ReadbackSlot::new(name, size_bytes), Arc::clone(&self.backend))
    }

    /// Records a copy of the first `size_bytes` of `source` into `destination`.
    ///
    /// # Errors
    ///
    /// Fails if the buffer belongs to another graph, the size is zero, not a
    /// multiple of 4, or larger than either side, or the readback already has
    /// a copy recorded.
    pub fn add_copy_pass(
        &mut self,
        source: &GpuBuffer,
        destination: &ReadbackHandle,
        size_bytes: u64,
    ) -> Result<PassIndex, ComputeError> {
        self.check_buffer(source)?;
        if size_bytes == 0 || size_bytes % 4 != 0 {
            return Err(ComputeError::MisalignedCopy(size_bytes));
        }
        let capacity = source.size_bytes().min(destination.size_bytes());
        if size_bytes > capacity {
            return Err(ComputeError::CopyOutOfRange { size: size_bytes, capacity });
        }
        destination.slot().claim()?;

        let index = self.next_index();
        let slot = source.handle.index();
        let dependencies: Vec<PassIndex> = self.last_writer[slot].into_iter().collect();
        self.readers_since_write[slot].push(index);

        let label = format!("CopyTo{}", destination.name());
        tracing::trace!("{}: copy pass {label} ({size_bytes} bytes) after {:?}", self.label, dependencies);
        self.passes.push(Pass::Copy(CopyPass {
            label,
            source: *source,
            destination: Arc::clone(destination.slot()),
            size_bytes,
            dependencies,
        }));
        self.readbacks.push(Arc::clone(destination.slot()));
        Ok(index)
    }

    /// Creates a readback and records the copy into it in one step.
    ///
    /// # Errors
    ///
    /// See [`add_copy_pass`](Self::add_copy_pass).
    pub fn request_readback(
        &mut self,
        name: &str,
        source: &GpuBuffer,
        size_bytes: u64,
    ) -> Result<ReadbackHandle, ComputeError> {
        let handle = self.create_readback(name, size_bytes);
        self.add_copy_pass(source, &handle, size_bytes)?;
        Ok(handle)
    }

    /// Submits the graph. Readbacks it copies into become pending.
    ///
    /// # Errors
    ///
    /// Propagates the backend's submit error; the graph's readbacks are then
    /// marked failed.
    pub fn execute(self) -> Result<SubmissionIndex, ComputeError> {
        let PassGraph {
            label,
            backend,
            buffers,
            passes,
            readbacks,
            ..
        } = self;

        tracing::debug!(
            "Executing graph {label}: {} buffer(s), {} pass(es) on {}",
            buffers.len(),
            passes.len(),
            backend.name()
        );
        for slot in &readbacks {
            slot.mark_pending();
        }
        let submission = Submission { label, buffers, passes };
        match backend.submit(submission) {
            Ok(index) => Ok(index),
            Err(e) => {
                for slot in &readbacks {
                    slot.fail();
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for PassGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassGraph")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("backend", &self.backend.name())
            .field("buffers", &self.buffers.len())
            .field("passes", &self.passes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kernel, BufferInit, CpuBackend, FeatureLevel, ReadbackState, ScaleParameters};

    fn scale_kernel() -> KernelBinding {
        kernel::startup("/opt/shaders").unwrap().scale_kernel().unwrap().clone()
    }

    fn graph() -> PassGraph {
        PassGraph::new(Arc::new(CpuBackend::new()), "graph-test")
    }

    #[test]
    fn passes_are_recorded_in_call_order_with_dependencies() {
        let kernel = scale_kernel();
        let mut graph = graph();
        let a = graph.create_buffer("a", BufferInit::default(), 64).unwrap();
        let b = graph.create_buffer("b", BufferInit::default(), 64).unwrap();

        let first = graph
            .add_compute_pass("first", &kernel, &PassParameters::new(ScaleParameters::new(2.0, 64), a), [1, 1, 1])
            .unwrap();
        let other = graph
            .add_compute_pass("other", &kernel, &PassParameters::new(ScaleParameters::new(2.0, 64), b), [1, 1, 1])
            .unwrap();
        let readback = graph.request_readback("a", &a, a.size_bytes()).unwrap();
        let copy = PassIndex(graph.passes().len() - 1);
        let second = graph
            .add_compute_pass("second", &kernel, &PassParameters::new(ScaleParameters::new(3.0, 64), a), [1, 1, 1])
            .unwrap();

        let labels: Vec<&str> = graph.passes().iter().map(Pass::label).collect();
        assert_eq!(labels, ["first", "other", "CopyToa", "second"]);
        assert!(graph.dependencies(first).is_empty());
        assert!(graph.dependencies(other).is_empty());
        assert_eq!(graph.dependencies(copy), &[first]);
        assert_eq!(graph.dependencies(second), &[first, copy]);
        assert_eq!(readback.state(), ReadbackState::NotRequested);
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let kernel = scale_kernel();
        let mut owner = graph();
        let mut other = graph();
        let buffer = owner.create_buffer("a", BufferInit::default(), 4).unwrap();
        let params = PassParameters::new(ScaleParameters::new(1.0, 4), buffer);

        assert!(matches!(
            other.add_compute_pass("x", &kernel, &params, [1, 1, 1]),
            Err(ComputeError::ForeignBuffer)
        ));
        assert!(matches!(
            other.request_readback("x", &buffer, 16),
            Err(ComputeError::ForeignBuffer)
        ));
    }

    #[test]
    fn parameter_size_must_match_registration() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct Wide {
            values: [f32; 8],
        }

        let kernel = scale_kernel();
        let mut graph = graph();
        let buffer = graph.create_buffer("a", BufferInit::default(), 4).unwrap();
        let params = PassParameters::new(Wide { values: [0.0; 8] }, buffer);
        assert!(matches!(
            graph.add_compute_pass("x", &kernel, &params, [1, 1, 1]),
            Err(ComputeError::ParameterLayout { expected: 16, actual: 32, .. })
        ));
    }

    #[test]
    fn kernel_must_support_device_feature_level() {
        let kernel = scale_kernel();
        let backend = Arc::new(CpuBackend::with_feature_level(FeatureLevel::Es31));
        let mut graph = PassGraph::new(backend, "es31");
        let buffer = graph.create_buffer("a", BufferInit::default(), 4).unwrap();
        let params = PassParameters::new(ScaleParameters::new(1.0, 4), buffer);
        assert!(matches!(
            graph.add_compute_pass("x", &kernel, &params, [1, 1, 1]),
            Err(ComputeError::KernelUnsupported { level: FeatureLevel::Es31, .. })
        ));
    }

    #[test]
    fn zero_groups_are_rejected() {
        let kernel = scale_kernel();
        let mut graph = graph();
        let buffer = graph.create_buffer("a", BufferInit::default(), 4).unwrap();
        let params = PassParameters::new(ScaleParameters::new(1.0, 4), buffer);
        assert!(graph.add_compute_pass("x", &kernel, &params, [0, 1, 1]).is_err());
        assert!(graph.passes().is_empty());
    }

    #[test]
    fn copy_validation() {
        let mut graph = graph();
        let buffer = graph.create_buffer("a", BufferInit::default(), 4).unwrap();
        assert!(matches!(graph.request_readback("r", &buffer, 0), Err(ComputeError::MisalignedCopy(0))));
        assert!(matches!(graph.request_readback("r", &buffer, 6), Err(ComputeError::MisalignedCopy(6))));
        assert!(matches!(
            graph.request_readback("r", &buffer, 20),
            Err(ComputeError::CopyOutOfRange { size: 20, capacity: 16 })
        ));

        let small = graph.create_readback("small", 8);
        assert!(matches!(
            graph.add_copy_pass(&buffer, &small, 16),
            Err(ComputeError::CopyOutOfRange { size: 16, capacity: 8 })
        ));
        graph.add_copy_pass(&buffer, &small, 8).unwrap();
        assert!(matches!(graph.add_copy_pass(&buffer, &small, 8), Err(ComputeError::ReadbackInUse(_))));
    }

    #[test]
    fn execute_marks_readbacks_pending() {
        let mut graph = graph();
        let buffer = graph.create_buffer("a", BufferInit::default(), 4).unwrap();
        let readback = graph.request_readback("r", &buffer, 16).unwrap();
        let index = graph.execute().unwrap();
        assert_eq!(index, SubmissionIndex(0));
        assert_eq!(readback.state(), ReadbackState::Pending);
    }

    #[test]
    fn failed_submit_fails_readbacks() {
        let kernel = scale_kernel();
        let backend = Arc::new(CpuBackend::empty());
        let mut graph = PassGraph::new(backend, "no-kernels");
        let buffer = graph.create_buffer("a", BufferInit::default(), 4).unwrap();
        let params = PassParameters::new(ScaleParameters::new(1.0, 4), buffer);
        graph.add_compute_pass("x", &kernel, &params, [1, 1, 1]).unwrap();
        let readback = graph.request_readback("r", &buffer, 16).unwrap();

        assert!(matches!(graph.execute(), Err(ComputeError::MissingKernel(_))));
        assert_eq!(readback.state(), ReadbackState::Failed);
        assert!(matches!(readback.lock(16), Err(ComputeError::ReadbackFailed(_))));
    }
}
