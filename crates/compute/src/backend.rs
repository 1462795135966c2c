use crate::{ComputeError, FeatureLevel, Submission};

/// Largest buffer a backend accepts unless it reports its own limit.
/// Matches the WebGPU default for a storage buffer binding.
pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 128 << 20;

/// Position of a submission in a backend's queue. Increases by one per submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionIndex(pub u64);

pub trait ComputeBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Capability tier of the device. Kernels not compiled for it cannot be dispatched.
    fn feature_level(&self) -> FeatureLevel;

    /// Largest single buffer, in bytes, the device can bind as storage.
    fn max_buffer_size(&self) -> u64 {
        DEFAULT_MAX_BUFFER_SIZE
    }

    /// Queues an executed pass graph.
    ///
    /// Submissions run in the order they are submitted. The call returns once
    /// the work is queued; it does not wait for the device. Readback slots
    /// referenced by copy passes are completed later, from [`poll`] or
    /// [`wait_idle`].
    ///
    /// # Errors
    ///
    /// Returns an error if the submission cannot be prepared, e.g. a kernel
    /// pipeline fails to build or a buffer cannot be allocated. Nothing from a
    /// failed submission reaches the device.
    ///
    /// [`poll`]: ComputeBackend::poll
    /// [`wait_idle`]: ComputeBackend::wait_idle
    fn submit(&self, submission: Submission) -> Result<SubmissionIndex, ComputeError>;

    /// Lets the device make progress and completes any finished readbacks.
    /// Never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is lost.
    fn poll(&self) -> Result<(), ComputeError>;

    /// Whether the submission at `index` has finished running.
    fn is_retired(&self, index: SubmissionIndex) -> bool;

    /// Blocks until every submission so far has retired, not just one graph,
    /// including one another thread is retiring through [`poll`].
    ///
    /// [`poll`]: ComputeBackend::poll
    ///
    /// # Errors
    ///
    /// Returns an error if the device is lost.
    fn wait_idle(&self) -> Result<(), ComputeError>;

    /// Drops cached pipelines so the next dispatch rebuilds them from source.
    fn invalidate_pipelines(&self) {}
}
