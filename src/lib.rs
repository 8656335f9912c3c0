//! rhi - a render hardware interface with refcounted state-object caching
//!
//! The crate exposes one device facade ([`Rhi`]) over interchangeable
//! backends:
//! - **headless**: software simulation of the full contract, the default
//!   and the one the test suite runs against
//! - **wgpu**: cross-platform GPU abstraction (feature `wgpu-backend`)
//! - **Vulkan**: direct Vulkan via ash (feature `vulkan-backend`)
//!
//! # Features
//! - Fixed-function render state deduplicated through packed 64-bit keys
//!   with explicit reference counting
//! - Reflection-driven shader parameters with shadow-copy dirty tracking,
//!   so unchanged uniforms cost no uploads
//! - WGSL shaders validated at bind time; a broken shader degrades to a
//!   magenta error shader instead of failing the frame
//! - Explicit frame lifecycle with bounded fence waits and configurable
//!   frames in flight

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod material;
pub mod mesh;
pub mod params;
pub mod renderable;
pub mod rhi;
pub mod shader;
pub mod state_cache;
pub mod target;
pub mod texture;
pub mod types;

pub use backend::{BackendStats, FrameContext, RenderBackend, ResourceId, SurfaceTarget};
pub use buffer::{BufferKind, DeviceBuffer};
pub use config::{BackendKind, RhiConfig};
pub use error::{RhiError, RhiResult};
pub use material::{Material, MaterialDescriptor, ParamValue, TextureBinding};
pub use mesh::{Mesh, Vertex, VertexAttribute, VertexAttributeFormat, VertexLayout, VertexSemantic};
pub use params::FrameParams;
pub use renderable::Renderable;
pub use rhi::Rhi;
pub use shader::{Shader, ShaderStage};
pub use target::{RenderTarget, View};
pub use texture::Texture;
pub use types::{
    AddressMode, BlendComponent, BlendFactor, BlendOperation, BlendState, BufferUsage,
    ColorWrites, CompareFunction, CullMode, FilterMode, FrontFace, RenderState,
    SamplerDescriptor, ScissorRect, StencilOperation, StencilState, TextureFormat, TextureUsage,
    Viewport,
};
