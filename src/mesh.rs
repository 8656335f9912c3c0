//! Vertex layouts and meshes.

use bytemuck::{Pod, Zeroable};

use crate::buffer::{BufferKind, DeviceBuffer};
use crate::error::{RhiError, RhiResult};
use crate::types::BufferUsage;

/// Hard cap on attributes per vertex layout; keys reserve slots up to this.
pub const MAX_VERTEX_ATTRIBUTES: usize = 8;

/// What a vertex attribute means to the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    Tangent,
    Color,
    TexCoord0,
    TexCoord1,
}

/// Component count and type of one vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttributeFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Unorm8,
    Unorm8x2,
    Unorm8x4,
}

impl VertexAttributeFormat {
    /// Size of one attribute in bytes.
    pub fn size(&self) -> u32 {
        match self {
            VertexAttributeFormat::Float32 => 4,
            VertexAttributeFormat::Float32x2 => 8,
            VertexAttributeFormat::Float32x3 => 12,
            VertexAttributeFormat::Float32x4 => 16,
            VertexAttributeFormat::Unorm8 => 1,
            VertexAttributeFormat::Unorm8x2 => 2,
            VertexAttributeFormat::Unorm8x4 => 4,
        }
    }
}

/// One entry of a vertex layout; offsets are implied by order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub semantic: VertexSemantic,
    pub format: VertexAttributeFormat,
}

/// Ordered attribute list describing one interleaved vertex stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub fn new(attributes: Vec<VertexAttribute>) -> RhiResult<Self> {
        if attributes.is_empty() {
            return Err(RhiError::InvalidParameter(
                "vertex layout needs at least one attribute".to_string(),
            ));
        }
        if attributes.len() > MAX_VERTEX_ATTRIBUTES {
            return Err(RhiError::InvalidParameter(format!(
                "vertex layout has {} attributes, maximum is {}",
                attributes.len(),
                MAX_VERTEX_ATTRIBUTES
            )));
        }
        Ok(Self { attributes })
    }

    /// The standard position/normal/uv layout used by [`Vertex`].
    pub fn position_normal_uv() -> Self {
        Self {
            attributes: vec![
                VertexAttribute {
                    semantic: VertexSemantic::Position,
                    format: VertexAttributeFormat::Float32x3,
                },
                VertexAttribute {
                    semantic: VertexSemantic::Normal,
                    format: VertexAttributeFormat::Float32x3,
                },
                VertexAttribute {
                    semantic: VertexSemantic::TexCoord0,
                    format: VertexAttributeFormat::Float32x2,
                },
            ],
        }
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    /// Byte offset of the attribute at `index`.
    pub fn offset_of(&self, index: usize) -> u32 {
        self.attributes[..index].iter().map(|a| a.format.size()).sum()
    }

    /// Interleaved stride in bytes.
    pub fn stride(&self) -> u32 {
        self.attributes.iter().map(|a| a.format.size()).sum()
    }
}

/// Standard interleaved vertex matching [`VertexLayout::position_normal_uv`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Geometry: one vertex stream, an optional index stream and the layout
/// describing the stream to the input assembler.
#[derive(Debug)]
pub struct Mesh {
    layout: VertexLayout,
    vertex_buffer: DeviceBuffer,
    index_buffer: Option<DeviceBuffer>,
}

impl Mesh {
    pub fn new(
        layout: VertexLayout,
        vertex_buffer: DeviceBuffer,
        index_buffer: Option<DeviceBuffer>,
    ) -> RhiResult<Self> {
        if vertex_buffer.kind() != BufferKind::Vertex {
            return Err(RhiError::InvalidParameter(
                "mesh vertex stream must be a vertex buffer".to_string(),
            ));
        }
        if vertex_buffer.stride() != layout.stride() {
            return Err(RhiError::InvalidParameter(format!(
                "vertex buffer stride {} does not match layout stride {}",
                vertex_buffer.stride(),
                layout.stride()
            )));
        }
        if let Some(indices) = &index_buffer {
            if indices.kind() != BufferKind::Index {
                return Err(RhiError::InvalidParameter(
                    "mesh index stream must be an index buffer".to_string(),
                ));
            }
            if indices.stride() != 2 && indices.stride() != 4 {
                return Err(RhiError::InvalidParameter(
                    "index buffers must hold u16 or u32 indices".to_string(),
                ));
            }
        }
        Ok(Self {
            layout,
            vertex_buffer,
            index_buffer,
        })
    }

    /// Convenience for the standard vertex type.
    pub fn from_vertices(vertices: &[Vertex], indices: &[u32]) -> RhiResult<Self> {
        let vertex_buffer =
            DeviceBuffer::from_slice(BufferKind::Vertex, vertices, BufferUsage::STATIC)?;
        let index_buffer =
            DeviceBuffer::from_slice(BufferKind::Index, indices, BufferUsage::STATIC)?;
        Self::new(
            VertexLayout::position_normal_uv(),
            vertex_buffer,
            Some(index_buffer),
        )
    }

    pub fn layout(&self) -> &VertexLayout {
        &self.layout
    }

    pub fn vertex_buffer(&self) -> &DeviceBuffer {
        &self.vertex_buffer
    }

    pub fn vertex_buffer_mut(&mut self) -> &mut DeviceBuffer {
        &mut self.vertex_buffer
    }

    pub fn index_buffer(&self) -> Option<&DeviceBuffer> {
        self.index_buffer.as_ref()
    }

    pub fn index_buffer_mut(&mut self) -> Option<&mut DeviceBuffer> {
        self.index_buffer.as_mut()
    }

    /// Number of elements a draw of this mesh covers.
    pub fn draw_count(&self) -> u32 {
        match &self.index_buffer {
            Some(indices) => indices.element_count(),
            None => self.vertex_buffer.element_count(),
        }
    }

    /// Unit cube centered at the origin.
    pub fn cube() -> RhiResult<Self> {
        let h = 0.5f32;
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, right, up) in faces {
            let base = vertices.len() as u32;
            for (u, v) in [(0.0f32, 0.0f32), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                let position = [
                    normal[0] * h + right[0] * (u - 0.5) * 2.0 * h + up[0] * (v - 0.5) * 2.0 * h,
                    normal[1] * h + right[1] * (u - 0.5) * 2.0 * h + up[1] * (v - 0.5) * 2.0 * h,
                    normal[2] * h + right[2] * (u - 0.5) * 2.0 * h + up[2] * (v - 0.5) * 2.0 * h,
                ];
                vertices.push(Vertex {
                    position,
                    normal,
                    uv: [u, v],
                });
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::from_vertices(&vertices, &indices)
    }

    /// Unit plane in the XZ plane, facing +Y.
    pub fn plane() -> RhiResult<Self> {
        let vertices = [
            Vertex {
                position: [-0.5, 0.0, -0.5],
                normal: [0.0, 1.0, 0.0],
                uv: [0.0, 0.0],
            },
            Vertex {
                position: [0.5, 0.0, -0.5],
                normal: [0.0, 1.0, 0.0],
                uv: [1.0, 0.0],
            },
            Vertex {
                position: [0.5, 0.0, 0.5],
                normal: [0.0, 1.0, 0.0],
                uv: [1.0, 1.0],
            },
            Vertex {
                position: [-0.5, 0.0, 0.5],
                normal: [0.0, 1.0, 0.0],
                uv: [0.0, 1.0],
            },
        ];
        let indices = [0u32, 2, 1, 0, 3, 2];
        Self::from_vertices(&vertices, &indices)
    }
}

static_assertions::assert_impl_all!(Mesh: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_stride_and_offsets() {
        let layout = VertexLayout::position_normal_uv();
        assert_eq!(layout.stride(), 32);
        assert_eq!(layout.offset_of(0), 0);
        assert_eq!(layout.offset_of(1), 12);
        assert_eq!(layout.offset_of(2), 24);
    }

    #[test]
    fn test_layout_attribute_cap() {
        let attr = VertexAttribute {
            semantic: VertexSemantic::Color,
            format: VertexAttributeFormat::Unorm8x4,
        };
        let result = VertexLayout::new(vec![attr; MAX_VERTEX_ATTRIBUTES + 1]);
        assert!(matches!(result, Err(RhiError::InvalidParameter(_))));
    }

    #[test]
    fn test_cube_counts() {
        let cube = Mesh::cube().unwrap();
        assert_eq!(cube.vertex_buffer().element_count(), 24);
        assert_eq!(cube.draw_count(), 36);
    }

    #[test]
    fn test_stride_mismatch_rejected() {
        let vertex_buffer =
            DeviceBuffer::new(BufferKind::Vertex, 16, 4, BufferUsage::STATIC).unwrap();
        let result = Mesh::new(VertexLayout::position_normal_uv(), vertex_buffer, None);
        assert!(matches!(result, Err(RhiError::InvalidParameter(_))));
    }

    #[test]
    fn test_plane_is_indexed() {
        let plane = Mesh::plane().unwrap();
        assert!(plane.index_buffer().is_some());
        assert_eq!(plane.draw_count(), 6);
    }
}
