//! CPU-side device buffers.
//!
//! A [`DeviceBuffer`] exclusively owns its bytes; backends keep a GPU copy in
//! their arenas, refreshed from here when the dirty flag is set. Static
//! buffers upload once at first bind and are never touched again.

use crate::backend::ResourceId;
use crate::error::{RhiError, RhiResult};
use crate::types::BufferUsage;

/// What the buffer feeds into the input assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// A host-owned buffer mirrored into GPU memory on bind.
#[derive(Debug)]
pub struct DeviceBuffer {
    id: ResourceId,
    kind: BufferKind,
    usage: BufferUsage,
    stride: u32,
    element_count: u32,
    data: Vec<u8>,
    dirty: bool,
}

impl DeviceBuffer {
    /// Allocates host storage for `element_count` elements of `stride` bytes.
    ///
    /// The GPU copy is created lazily at first bind. A fresh buffer is dirty
    /// so the initial upload happens on that bind.
    pub fn new(
        kind: BufferKind,
        stride: u32,
        element_count: u32,
        usage: BufferUsage,
    ) -> RhiResult<Self> {
        if stride == 0 {
            return Err(RhiError::InvalidParameter(
                "buffer stride must be non-zero".to_string(),
            ));
        }
        if element_count == 0 {
            return Err(RhiError::InvalidParameter(
                "buffer element count must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            id: ResourceId::allocate(),
            kind,
            usage,
            stride,
            element_count,
            data: vec![0; stride as usize * element_count as usize],
            dirty: true,
        })
    }

    /// Builds a buffer directly from typed elements.
    pub fn from_slice<T: bytemuck::Pod>(
        kind: BufferKind,
        elements: &[T],
        usage: BufferUsage,
    ) -> RhiResult<Self> {
        let stride = std::mem::size_of::<T>() as u32;
        let mut buffer = Self::new(kind, stride, elements.len() as u32, usage)?;
        buffer.data.copy_from_slice(bytemuck::cast_slice(elements));
        Ok(buffer)
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the raw bytes. Marks the buffer dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    /// Writes typed elements starting at `element_offset`. Marks dirty.
    pub fn write<T: bytemuck::Pod>(&mut self, element_offset: u32, elements: &[T]) -> RhiResult<()> {
        let stride = std::mem::size_of::<T>();
        if stride != self.stride as usize {
            return Err(RhiError::InvalidParameter(format!(
                "element size {} does not match buffer stride {}",
                stride, self.stride
            )));
        }
        let start = element_offset as usize * stride;
        let end = start + elements.len() * stride;
        if end > self.data.len() {
            return Err(RhiError::InvalidParameter(format!(
                "write of {} elements at offset {} exceeds buffer length {}",
                elements.len(),
                element_offset,
                self.element_count
            )));
        }
        self.data[start..end].copy_from_slice(bytemuck::cast_slice(elements));
        self.dirty = true;
        Ok(())
    }

    /// Flags the GPU copy stale after external byte-level writes.
    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Called by backends after the GPU copy has been refreshed.
    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

static_assertions::assert_impl_all!(DeviceBuffer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_dirty() {
        let buffer =
            DeviceBuffer::new(BufferKind::Vertex, 12, 3, BufferUsage::STATIC).unwrap();
        assert!(buffer.is_dirty());
        assert_eq!(buffer.size_bytes(), 36);
    }

    #[test]
    fn test_zero_stride_rejected() {
        let result = DeviceBuffer::new(BufferKind::Vertex, 0, 3, BufferUsage::STATIC);
        assert!(matches!(result, Err(RhiError::InvalidParameter(_))));
    }

    #[test]
    fn test_write_marks_dirty() {
        let mut buffer =
            DeviceBuffer::new(BufferKind::Index, 2, 6, BufferUsage::DYNAMIC).unwrap();
        buffer.mark_clean();
        assert!(!buffer.is_dirty());
        buffer.write::<u16>(0, &[0, 1, 2, 2, 1, 3]).unwrap();
        assert!(buffer.is_dirty());
        assert_eq!(&buffer.data()[..4], &[0, 0, 1, 0]);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mut buffer =
            DeviceBuffer::new(BufferKind::Index, 2, 3, BufferUsage::DYNAMIC).unwrap();
        let result = buffer.write::<u16>(2, &[1, 2]);
        assert!(matches!(result, Err(RhiError::InvalidParameter(_))));
    }

    #[test]
    fn test_from_slice() {
        let buffer = DeviceBuffer::from_slice(
            BufferKind::Index,
            &[0u32, 1, 2],
            BufferUsage::STATIC,
        )
        .unwrap();
        assert_eq!(buffer.stride(), 4);
        assert_eq!(buffer.element_count(), 3);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = DeviceBuffer::new(BufferKind::Vertex, 4, 1, BufferUsage::STATIC).unwrap();
        let b = DeviceBuffer::new(BufferKind::Vertex, 4, 1, BufferUsage::STATIC).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
