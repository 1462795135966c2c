//! GPU to host readback.
//!
//! A readback moves through `NotRequested -> Pending -> Ready -> Released`.
//! The copy is enqueued by [`PassGraph::request_readback`] or
//! [`PassGraph::add_copy_pass`] and becomes pending when the graph executes.
//! The backend fills the slot once the device has finished all prior work;
//! [`ReadbackHandle::is_ready`] drives that progress without blocking.
//!
//! Host memory is reclaimed when the handle is released, either explicitly or
//! on drop, so every exit path releases it.
//!
//! [`PassGraph::request_readback`]: crate::PassGraph::request_readback
//! [`PassGraph::add_copy_pass`]: crate::PassGraph::add_copy_pass

use crate::{ComputeBackend, ComputeError};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackState {
    NotRequested,
    Pending,
    Ready,
    /// The device could not map the staging memory.
    Failed,
    Released,
}

#[derive(Debug)]
struct SlotInner {
    state: ReadbackState,
    data: Option<Arc<[u8]>>,
    claimed: bool,
    locked: bool,
    lock_generation: u64,
}

/// Host-visible destination of a copy pass, shared between a
/// [`ReadbackHandle`] and the backend that completes it.
#[derive(Debug)]
pub struct ReadbackSlot {
    name: String,
    size_bytes: u64,
    inner: Mutex<SlotInner>,
}

impl ReadbackSlot {
    pub(crate) fn new(name: &str, size_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            size_bytes,
            inner: Mutex::new(SlotInner {
                state: ReadbackState::NotRequested,
                data: None,
                claimed: false,
                locked: false,
                lock_generation: 0,
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[must_use]
    pub fn state(&self) -> ReadbackState {
        self.inner.lock().state
    }

    /// Claims the slot for a copy pass. Each slot receives exactly one copy.
    pub(crate) fn claim(&self) -> Result<(), ComputeError> {
        let mut inner = self.inner.lock();
        if inner.claimed || inner.state != ReadbackState::NotRequested {
            return Err(ComputeError::ReadbackInUse(self.name.clone()));
        }
        inner.claimed = true;
        Ok(())
    }

    pub(crate) fn mark_pending(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ReadbackState::NotRequested {
            inner.state = ReadbackState::Pending;
        }
    }

    /// Stores the copied bytes and makes the slot ready.
    ///
    /// Called by backends once the copy has retired. Completing a released
    /// slot discards the bytes.
    pub fn complete(&self, bytes: Vec<u8>) {
        let mut inner = self.inner.lock();
        match inner.state {
            ReadbackState::Pending | ReadbackState::NotRequested => {
                inner.data = Some(bytes.into());
                inner.state = ReadbackState::Ready;
            }
            ReadbackState::Released => {
                tracing::trace!("Discarding {} bytes for released readback {}", bytes.len(), self.name);
            }
            ReadbackState::Ready | ReadbackState::Failed => {
                tracing::warn!("Readback {} completed twice; keeping the first result", self.name);
            }
        }
    }

    /// Marks the copy as failed on the device.
    pub fn fail(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ReadbackState::Released {
            inner.state = ReadbackState::Failed;
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.state = ReadbackState::Released;
        inner.data = None;
        inner.locked = false;
    }
}

/// Owner of one readback. Releases its host memory on drop.
pub struct ReadbackHandle {
    slot: Arc<ReadbackSlot>,
    backend: Arc<dyn ComputeBackend>,
}

impl ReadbackHandle {
    pub(crate) fn new(slot: Arc<ReadbackSlot>, backend: Arc<dyn ComputeBackend>) -> Self {
        Self { slot, backend }
    }

    pub(crate) fn slot(&self) -> &Arc<ReadbackSlot> {
        &self.slot
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.slot.name()
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.slot.size_bytes()
    }

    #[must_use]
    pub fn state(&self) -> ReadbackState {
        self.slot.state()
    }

    /// Lets the backend make progress, then reports whether the data has arrived.
    ///
    /// Never blocks on the device.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        if self.slot.state() == ReadbackState::Pending {
            if let Err(e) = self.backend.poll() {
                tracing::warn!("Polling {} for readback {} failed: {e}", self.backend.name(), self.name());
            }
        }
        self.slot.state() == ReadbackState::Ready
    }

    /// Maps the first `size_bytes` of the readback for reading.
    ///
    /// Only succeeds after [`is_ready`](Self::is_ready) has returned `true`;
    /// it does not poll or wait. The view unlocks when dropped.
    ///
    /// # Errors
    ///
    /// [`ComputeError::ReadbackNotReady`] before the data has arrived,
    /// [`ComputeError::ReadbackFailed`] if the device failed the copy,
    /// [`ComputeError::ReadbackLocked`] while another view is alive, and
    /// [`ComputeError::CopyOutOfRange`] if `size_bytes` exceeds the readback.
    pub fn lock(&self, size_bytes: u64) -> Result<ReadbackView<'_>, ComputeError> {
        let mut inner = self.slot.inner.lock();
        match inner.state {
            ReadbackState::Ready => {}
            ReadbackState::Failed => return Err(ComputeError::ReadbackFailed(self.slot.name.clone())),
            _ => return Err(ComputeError::ReadbackNotReady(self.slot.name.clone())),
        }
        if inner.locked {
            return Err(ComputeError::ReadbackLocked(self.slot.name.clone()));
        }
        let data = inner
            .data
            .clone()
            .ok_or_else(|| ComputeError::ReadbackNotReady(self.slot.name.clone()))?;
        let len = usize::try_from(size_bytes)
            .ok()
            .filter(|len| *len <= data.len())
            .ok_or(ComputeError::CopyOutOfRange {
                size: size_bytes,
                capacity: data.len() as u64,
            })?;
        inner.locked = true;
        inner.lock_generation += 1;
        Ok(ReadbackView {
            handle: self,
            data,
            len,
            generation: inner.lock_generation,
        })
    }

    /// Ends the current lock.
    ///
    /// Views unlock themselves on drop, so this is only needed by callers
    /// managing the lock by hand. Calling it without an active lock is reported
    /// and leaves the readback unchanged.
    ///
    /// # Errors
    ///
    /// [`ComputeError::ReadbackNotLocked`] if nothing is locked.
    pub fn unlock(&self) -> Result<(), ComputeError> {
        let mut inner = self.slot.inner.lock();
        if !inner.locked {
            tracing::warn!("Unlock of readback {} without a matching lock", self.slot.name);
            return Err(ComputeError::ReadbackNotLocked(self.slot.name.clone()));
        }
        inner.locked = false;
        Ok(())
    }

    /// Releases the host memory now rather than at drop.
    pub fn release(self) {}

    fn unlock_generation(&self, generation: u64) {
        let mut inner = self.slot.inner.lock();
        if inner.locked && inner.lock_generation == generation {
            inner.locked = false;
        }
    }
}

impl Drop for ReadbackHandle {
    fn drop(&mut self) {
        tracing::trace!("Releasing readback {} ({:?})", self.slot.name, self.slot.state());
        self.slot.release();
    }
}

impl std::fmt::Debug for ReadbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadbackHandle")
            .field("name", &self.slot.name)
            .field("size_bytes", &self.slot.size_bytes)
            .field("state", &self.slot.state())
            .finish_non_exhaustive()
    }
}

/// Read-only view of a locked readback.
pub struct ReadbackView<'a> {
    handle: &'a ReadbackHandle,
    data: Arc<[u8]>,
    len: usize,
    generation: u64,
}

impl ReadbackView<'_> {
    /// Copies the bytes out as `T`s. Trailing bytes that do not fill a `T` are
    /// ignored; a zero-sized `T` yields nothing.
    #[must_use]
    pub fn values<T: Pod>(&self) -> Vec<T> {
        if std::mem::size_of::<T>() == 0 {
            return Vec::new();
        }
        self.chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Ends the lock early.
    pub fn unlock(self) {}
}

impl Deref for ReadbackView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Drop for ReadbackView<'_> {
    fn drop(&mut self) {
        self.handle.unlock_generation(self.generation);
    }
}
