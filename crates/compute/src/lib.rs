#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
//! # ClothCompute
//!
//! A small GPU compute dispatch and readback pipeline.
//!
//! The crate describes one unit of GPU work (a parameter block, a structured
//! buffer and a dispatch size), records it into a single-use [`PassGraph`],
//! submits it to a [`ComputeBackend`] and optionally copies the result back to
//! host memory through a [`ReadbackHandle`].
//!
//! ## Key Components
//!
//! -   **Parameter descriptor:** [`layout::ScaleParameters`] is the uniform
//!     block shared with the WGSL kernel. Its byte layout is a wire contract.
//! -   **Kernel registry:** [`kernel::KernelRegistry`] maps virtual shader
//!     paths to source files and holds the immutable [`KernelBinding`]s.
//!     It is built once through [`startup`] and only read afterwards.
//! -   **Pass graph:** [`PassGraph`] records buffer uploads, compute passes and
//!     copy passes in order and submits them atomically.
//! -   **Readback channel:** [`ReadbackHandle`] is polled with `is_ready`,
//!     locked for a read-only view and released on drop.
//! -   **Dispatcher:** [`Dispatcher`] owns the GPU-submission thread. Host code
//!     enqueues [`TriggerParams`] snapshots through a [`WorkQueue`].
//!
//! Two backends are provided: [`CpuBackend`], a deterministic reference device
//! used by the tests, and `WgpuBackend` behind the `gpu` feature.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub mod backend;
pub mod buffer;
pub mod config;
pub mod cpu_backend;
pub mod dispatcher;
pub mod graph;
pub mod kernel;
pub mod kernels;
pub mod layout;
pub mod readback;

#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use backend::{ComputeBackend, SubmissionIndex, DEFAULT_MAX_BUFFER_SIZE};
pub use buffer::{BufferHandle, BufferInit, BufferView, GpuBuffer, DEFAULT_FILL_VALUE};
pub use config::{DispatchConfig, ReadbackPolicy};
pub use cpu_backend::CpuBackend;
pub use dispatcher::{DispatchReport, Dispatcher, TriggerParams, WorkQueue};
pub use graph::{Pass, PassGraph, PassIndex, Submission};
pub use kernel::{startup, FeatureLevel, KernelBinding, KernelDesc, KernelRegistry};
pub use layout::{PassParameters, ScaleParameters};
pub use readback::{ReadbackHandle, ReadbackState, ReadbackView};

#[cfg(feature = "gpu")]
pub use wgpu_backend::WgpuBackend;

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("buffer shape mismatch: {0}")]
    ShapeMismatch(&'static str),
    #[error("backend not available")]
    BackendUnavailable,
    #[error("cannot allocate {size_bytes} bytes for `{name}`")]
    Allocation { name: String, size_bytes: u64 },
    #[error("buffer `{0}` must hold at least one element")]
    EmptyBuffer(String),
    #[error("element stride {0} is not a multiple of 4 bytes")]
    MisalignedStride(usize),
    #[error("invalid virtual shader path `{0}`")]
    InvalidVirtualPath(String),
    #[error("no shader directory is mapped for `{0}`")]
    UnmappedVirtualPath(String),
    #[error("kernel `{entry_point}` in `{virtual_path}` is not supported by any compiled target")]
    NoSupportedTarget {
        virtual_path: String,
        entry_point: String,
    },
    #[error("kernel `{entry_point}` is not compiled for feature level {level:?}")]
    KernelUnsupported {
        entry_point: String,
        level: FeatureLevel,
    },
    #[error("kernel `{0}` is already registered")]
    DuplicateKernel(String),
    #[error("parameter block size {0} is not a multiple of {align} bytes", align = layout::UNIFORM_ALIGNMENT)]
    MisalignedParameters(usize),
    #[error("parameter block is {actual} bytes but kernel `{entry_point}` expects {expected}")]
    ParameterLayout {
        entry_point: String,
        expected: usize,
        actual: usize,
    },
    #[error("buffer belongs to a different pass graph")]
    ForeignBuffer,
    #[error("copy of {size} bytes exceeds the {capacity} bytes available")]
    CopyOutOfRange { size: u64, capacity: u64 },
    #[error("copy size {0} is not a multiple of 4 bytes")]
    MisalignedCopy(u64),
    #[error("readback `{0}` is already in use")]
    ReadbackInUse(String),
    #[error("readback `{0}` is not ready")]
    ReadbackNotReady(String),
    #[error("readback `{0}` is already locked")]
    ReadbackLocked(String),
    #[error("readback `{0}` is not locked")]
    ReadbackNotLocked(String),
    #[error("readback `{0}` failed on the device")]
    ReadbackFailed(String),
    #[error("no CPU implementation for kernel entry point `{0}`")]
    MissingKernel(String),
    #[error("device rejected `{label}`: {message}")]
    DeviceRejected { label: String, message: String },
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),
    #[error("failed to read shader source {path:?}: {source}")]
    ShaderSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dispatch queue is closed")]
    QueueClosed,
    #[error("failed to start the submission thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Returns a compute backend if available, falling back to the CPU implementation.
///
/// With the `gpu` feature enabled this will attempt to create a
/// [`WgpuBackend`]. If device initialization fails or the feature is not
/// enabled, a [`CpuBackend`] is returned.
#[must_use]
pub fn default_backend() -> Arc<dyn ComputeBackend> {
    #[cfg(feature = "gpu")]
    {
        match WgpuBackend::try_new() {
            Ok(gpu) => {
                tracing::info!("Using wgpu backend on {}.", gpu.adapter_name());
                return Arc::new(gpu);
            }
            Err(e) => tracing::warn!("wgpu backend initialization failed ({e}), falling back..."),
        }
    }

    tracing::info!("Using CPU backend.");
    Arc::new(CpuBackend::new())
}
