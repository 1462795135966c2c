//! Structured buffer allocation inside a [`PassGraph`].
//!
//! Buffers are transient: they belong to the graph that created them and are
//! uploaded as part of that graph's submission.

use crate::graph::{GraphId, PassGraph};
use crate::ComputeError;
use bytemuck::Pod;
use std::sync::Arc;

/// Value written to every element when no initial data is supplied.
pub const DEFAULT_FILL_VALUE: f32 = 1.5;

/// Identifies a buffer within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub(crate) graph: GraphId,
    pub(crate) index: u32,
}

impl BufferHandle {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// A GPU-resident strided array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBuffer {
    pub handle: BufferHandle,
    pub element_stride: u32,
    pub element_count: u32,
}

impl GpuBuffer {
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.element_stride) * u64::from(self.element_count)
    }
}

/// Initial contents of an `f32` buffer.
#[derive(Debug, Clone, Copy)]
pub enum BufferInit<'a> {
    /// Explicit data; its length must equal the element count.
    Data(&'a [f32]),
    /// Every element set to the given value.
    Fill(f32),
}

impl Default for BufferInit<'_> {
    fn default() -> Self {
        BufferInit::Fill(DEFAULT_FILL_VALUE)
    }
}

/// Host-side bytes uploaded into a buffer at the start of a submission.
#[derive(Clone, Debug)]
pub struct BufferView {
    pub name: String,
    pub data: Arc<[u8]>,
    pub element_count: usize,
    pub element_size_in_bytes: usize,
}

impl BufferView {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Arc<[u8]>, element_count: usize, element_size_in_bytes: usize) -> Self {
        Self {
            name: name.into(),
            data,
            element_count,
            element_size_in_bytes,
        }
    }

    /// Checks that the data length matches `element_count * element_size_in_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ShapeMismatch`] on a length mismatch.
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.data.len() != self.element_count * self.element_size_in_bytes {
            return Err(ComputeError::ShapeMismatch(
                "Buffer data length does not match element count and element size",
            ));
        }
        Ok(())
    }
}

impl PassGraph {
    /// Creates an `f32` structured buffer of `element_count` elements.
    ///
    /// # Errors
    ///
    /// Fails if `element_count` is zero, explicit data has the wrong length or
    /// the buffer is larger than the backend can allocate.
    pub fn create_buffer(
        &mut self,
        name: &str,
        init: BufferInit<'_>,
        element_count: u32,
    ) -> Result<GpuBuffer, ComputeError> {
        match init {
            BufferInit::Data(data) => {
                if data.len() != element_count as usize {
                    return Err(ComputeError::ShapeMismatch(
                        "initial data length must equal the element count",
                    ));
                }
                self.create_structured_buffer(name, data)
            }
            BufferInit::Fill(value) => {
                if element_count == 0 {
                    return Err(ComputeError::EmptyBuffer(name.to_owned()));
                }
                let len = element_count as usize;
                let size_bytes = u64::from(element_count) * 4;
                self.check_allocation(name, size_bytes)?;
                let mut data = Vec::new();
                data.try_reserve_exact(len).map_err(|_| allocation(name, size_bytes))?;
                data.resize(len, value);
                self.create_structured_buffer(name, &data)
            }
        }
    }

    /// Creates a structured buffer holding a copy of `data`, one element per `T`.
    ///
    /// # Errors
    ///
    /// Fails if `data` is empty, `T` is not a multiple of 4 bytes or the copy
    /// cannot be allocated.
    pub fn create_structured_buffer<T: Pod>(&mut self, name: &str, data: &[T]) -> Result<GpuBuffer, ComputeError> {
        let stride = std::mem::size_of::<T>();
        if stride == 0 || stride % 4 != 0 {
            return Err(ComputeError::MisalignedStride(stride));
        }
        if data.is_empty() {
            return Err(ComputeError::EmptyBuffer(name.to_owned()));
        }
        let element_count = u32::try_from(data.len())
            .map_err(|_| ComputeError::ShapeMismatch("element count exceeds u32::MAX"))?;
        let element_stride =
            u32::try_from(stride).map_err(|_| ComputeError::ShapeMismatch("element stride exceeds u32::MAX"))?;
        let index = u32::try_from(self.buffers.len())
            .map_err(|_| ComputeError::ShapeMismatch("too many buffers in one graph"))?;

        let buffer = GpuBuffer {
            handle: BufferHandle { graph: self.id, index },
            element_stride,
            element_count,
        };
        let size_bytes = u64::from(element_stride) * u64::from(element_count);
        self.check_allocation(name, size_bytes)?;
        let bytes = bytemuck::cast_slice::<T, u8>(data);
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(bytes.len())
            .map_err(|_| allocation(name, size_bytes))?;
        owned.extend_from_slice(bytes);

        let view = BufferView::new(name, owned.into(), data.len(), stride);
        view.validate()?;
        tracing::trace!("{}: buffer {name} ({} x {stride} bytes)", self.label, data.len());
        self.push_buffer(view);
        Ok(buffer)
    }

    fn check_allocation(&self, name: &str, size_bytes: u64) -> Result<(), ComputeError> {
        let limit = self.backend().max_buffer_size();
        if size_bytes > limit {
            tracing::warn!("{}: buffer {name} needs {size_bytes} bytes, limit is {limit}", self.label);
            return Err(allocation(name, size_bytes));
        }
        Ok(())
    }
}

fn allocation(name: &str, size_bytes: u64) -> ComputeError {
    ComputeError::Allocation {
        name: name.to_owned(),
        size_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CpuBackend;

    fn graph() -> PassGraph {
        PassGraph::new(Arc::new(CpuBackend::new()), "buffer-test")
    }

    #[test]
    fn default_fill_is_one_and_a_half() {
        let mut graph = graph();
        let buffer = graph.create_buffer("data", BufferInit::default(), 256).unwrap();
        assert_eq!(buffer.element_count, 256);
        assert_eq!(buffer.element_stride, 4);
        assert_eq!(buffer.size_bytes(), 1024);

        let view = &graph.buffers[buffer.handle.index()];
        assert!(view
            .data
            .chunks_exact(4)
            .all(|c| f32::from_ne_bytes(c.try_into().unwrap()) == 1.5));
    }

    #[test]
    fn explicit_data_is_uploaded_verbatim() {
        let mut graph = graph();
        let data = [1.0f32, 2.0, 3.0];
        let buffer = graph.create_buffer("data", BufferInit::Data(&data), 3).unwrap();
        let view = &graph.buffers[buffer.handle.index()];
        assert_eq!(&view.data[..], bytemuck::cast_slice::<f32, u8>(&data));
    }

    #[test]
    fn data_length_must_match_count() {
        let mut graph = graph();
        let result = graph.create_buffer("data", BufferInit::Data(&[1.0, 2.0]), 3);
        assert!(matches!(result, Err(ComputeError::ShapeMismatch(_))));
    }

    #[test]
    fn zero_elements_is_rejected() {
        let mut graph = graph();
        let result = graph.create_buffer("data", BufferInit::Fill(0.0), 0);
        assert!(matches!(result, Err(ComputeError::EmptyBuffer(_))));
    }

    #[test]
    fn stride_must_be_word_aligned() {
        let mut graph = graph();
        let result = graph.create_structured_buffer("bytes", &[0u8; 16]);
        assert!(matches!(result, Err(ComputeError::MisalignedStride(1))));
        let ok = graph.create_structured_buffer("pairs", &[[0u32; 2]; 4]).unwrap();
        assert_eq!(ok.element_stride, 8);
        assert_eq!(ok.size_bytes(), 32);
    }

    #[test]
    fn handles_are_scoped_to_their_graph() {
        let mut a = graph();
        let mut b = graph();
        let in_a = a.create_buffer("x", BufferInit::default(), 4).unwrap();
        let in_b = b.create_buffer("x", BufferInit::default(), 4).unwrap();
        assert_eq!(in_a.handle.index(), in_b.handle.index());
        assert_ne!(in_a.handle, in_b.handle);
    }

    #[test]
    fn fill_larger_than_the_device_is_an_error() {
        let mut graph = graph();
        let result = graph.create_buffer("huge", BufferInit::default(), u32::MAX);
        assert!(matches!(
            result,
            Err(ComputeError::Allocation { size_bytes, .. }) if size_bytes == u64::from(u32::MAX) * 4
        ));
        assert!(graph.buffers.is_empty());
    }

    #[test]
    fn structured_buffer_respects_backend_limit() {
        let backend = Arc::new(CpuBackend::new().with_max_buffer_size(64));
        let mut graph = PassGraph::new(backend, "small-device");
        assert!(graph.create_structured_buffer("fits", &[0u32; 16]).is_ok());
        let result = graph.create_structured_buffer("spills", &[0u32; 17]);
        assert!(matches!(result, Err(ComputeError::Allocation { size_bytes: 68, .. })));
        assert_eq!(graph.buffers.len(), 1);
    }

    #[test]
    fn buffer_view_validate_catches_short_data() {
        let view = BufferView::new("v", vec![0u8; 12].into(), 4, 4);
        assert!(matches!(view.validate(), Err(ComputeError::ShapeMismatch(_))));
        let view = BufferView::new("v", vec![0u8; 16].into(), 4, 4);
        assert!(view.validate().is_ok());
    }
}
