//! Binding layout and parameter blocks shared with the WGSL kernels.
//!
//! Field order and sizes here are a wire contract with the compiled kernel:
//! reordering a field or changing its size invalidates every pipeline built
//! from the shader.

use crate::buffer::GpuBuffer;
use bytemuck::{Pod, Zeroable};

pub const UNIFORM_PARAMS: u32 = 0;
pub const STORAGE_DATA: u32 = 1;

pub const BINDING_COUNT: u32 = 2;

/// Uniform blocks must end on this boundary.
pub const UNIFORM_ALIGNMENT: usize = 16;

/// Threads per group declared by `MainCS` in `TestCompute.wgsl`.
pub const SCALE_THREADS_PER_GROUP: u32 = 64;

/// Uniform block of the scale kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ScaleParameters {
    pub multiplier: f32,
    pub element_count: u32,
    /// Alignment only.
    pub padding: [f32; 2],
}

const _: () = assert!(std::mem::size_of::<ScaleParameters>() == UNIFORM_ALIGNMENT);

impl ScaleParameters {
    #[must_use]
    pub const fn new(multiplier: f32, element_count: u32) -> Self {
        Self {
            multiplier,
            element_count,
            padding: [0.0; 2],
        }
    }
}

/// Everything a compute pass binds: the uniform block at [`UNIFORM_PARAMS`]
/// and the writable structured buffer at [`STORAGE_DATA`].
#[derive(Clone, Copy, Debug)]
pub struct PassParameters<P: Pod> {
    pub uniforms: P,
    pub data: GpuBuffer,
}

impl<P: Pod> PassParameters<P> {
    pub fn new(uniforms: P, data: GpuBuffer) -> Self {
        Self { uniforms, data }
    }

    #[must_use]
    pub fn uniform_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(&self.uniforms)
    }
}

/// Number of groups needed to cover `element_count` threads.
///
/// Rounds up, so the last group may be partially idle.
#[must_use]
pub const fn group_count(element_count: u32, threads_per_group: u32) -> u32 {
    element_count.div_ceil(threads_per_group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_parameters_fill_one_uniform_slot() {
        assert_eq!(std::mem::size_of::<ScaleParameters>(), 16);
        assert_eq!(std::mem::align_of::<ScaleParameters>(), 4);
        assert_eq!(std::mem::offset_of!(ScaleParameters, multiplier), 0);
        assert_eq!(std::mem::offset_of!(ScaleParameters, element_count), 4);
        assert_eq!(std::mem::offset_of!(ScaleParameters, padding), 8);
    }

    #[test]
    fn padding_is_zeroed() {
        let params = ScaleParameters::new(2.0, 256);
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(&bytes[8..], &[0u8; 8]);
        assert_eq!(f32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 2.0);
        assert_eq!(u32::from_ne_bytes(bytes[4..8].try_into().unwrap()), 256);
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(group_count(256, 64), 4);
        assert_eq!(group_count(1, 64), 1);
        assert_eq!(group_count(64, 64), 1);
        assert_eq!(group_count(65, 64), 2);
        assert_eq!(group_count(100, 64), 2);
        assert_eq!(group_count(0, 64), 0);
    }

    #[test]
    fn group_count_matches_ceiling_division() {
        for threads in [1u32, 7, 32, 64, 256] {
            for count in 1u32..600 {
                let groups = group_count(count, threads);
                assert!(groups * threads >= count);
                assert!((groups - 1) * threads < count);
            }
        }
    }
}
