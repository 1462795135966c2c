//! CPU implementations of the WGSL kernels, keyed by entry point.

pub mod scale_op;
pub use scale_op::main_cs;

use crate::kernel::SCALE_KERNEL_ENTRY;

/// One kernel invocation: uniform block bytes, the storage buffer bound at
/// `STORAGE_DATA` as 32-bit words, and the global invocation id.
pub type CpuKernel = fn(&[u8], &mut [u32], [u32; 3]);

/// Kernels every [`CpuBackend`](crate::CpuBackend) starts with.
#[must_use]
pub fn builtin() -> Vec<(&'static str, CpuKernel)> {
    vec![(SCALE_KERNEL_ENTRY, main_cs)]
}
