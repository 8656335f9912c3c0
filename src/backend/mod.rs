//! Backend abstraction.
//!
//! Every backend implements [`RenderBackend`]: the same bind/draw/unbind
//! protocol, the same state-object dedup semantics, the same frame
//! lifecycle. The concrete backend is chosen from configuration at startup
//! via [`create_backend`]; nothing downstream inspects which one it got.

pub mod headless;
#[cfg(feature = "vulkan-backend")]
pub mod vulkan;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_impl;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{BackendKind, RhiConfig};
use crate::error::{RhiError, RhiResult};
use crate::params::FrameParams;
use crate::renderable::Renderable;
use crate::shader::Shader;
use crate::target::{RenderTarget, View};
use crate::texture::Texture;
use crate::types::ScissorRect;

/// Stable identity of a data-model object (buffer, texture, shader,
/// renderable, render target). Backends keep their private records in arenas
/// keyed by this id; "not bound" is simply absence from the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Where a backend presents to.
#[derive(Debug, Clone)]
pub enum SurfaceTarget {
    Window(Arc<winit::window::Window>),
    /// No surface; frames render into an offscreen extent.
    Offscreen { width: u32, height: u32 },
}

impl SurfaceTarget {
    pub fn offscreen(width: u32, height: u32) -> Self {
        Self::Offscreen { width, height }
    }
}

/// Per-frame information handed out by `begin_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// Monotonic frame counter.
    pub frame_index: u64,
    /// Which in-flight slot this frame occupies.
    pub slot: usize,
    pub width: u32,
    pub height: u32,
}

/// Counters every backend maintains; the contract tests read them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Live entries per state-cache class.
    pub rasterizer_states: usize,
    pub blend_states: usize,
    pub depth_stencil_states: usize,
    pub input_layouts: usize,
    pub samplers: usize,
    /// Backends without standalone fixed-function objects dedup whole
    /// pipelines instead; those live here.
    pub pipelines: usize,
    /// Cumulative operation counts.
    pub buffer_uploads: u64,
    pub uniform_uploads: u64,
    pub draw_calls: u64,
    pub error_shader_substitutions: u64,
}

impl BackendStats {
    /// True when no state object of any class is alive.
    pub fn state_caches_empty(&self) -> bool {
        self.rasterizer_states == 0
            && self.blend_states == 0
            && self.depth_stencil_states == 0
            && self.input_layouts == 0
            && self.samplers == 0
            && self.pipelines == 0
    }
}

/// The contract all backends implement.
///
/// Call ordering (frame lifecycle, bind-before-draw) is enforced by the
/// facade; backends may `debug_assert!` it but must not rely on it for
/// memory safety.
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    fn surface_size(&self) -> (u32, u32);

    /// Recreates the swapchain/backing store. Only legal between frames;
    /// drains all in-flight work first.
    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()>;

    /// Waits (bounded) for the next frame slot's fence, then opens a frame.
    /// A fence timeout is fatal and reported as device loss.
    fn begin_frame(&mut self) -> RhiResult<FrameContext>;

    /// Submits the frame and presents, signalling the slot's fence.
    fn end_frame(&mut self) -> RhiResult<()>;

    /// Drains every in-flight frame. Used before teardown and resize.
    fn wait_idle(&mut self) -> RhiResult<()>;

    /// Routes subsequent draws to the given view, or back to the swapchain.
    fn set_view(&mut self, view: Option<&View>) -> RhiResult<()>;

    fn set_scissor(&mut self, scissor: Option<ScissorRect>);

    fn set_clear_color(&mut self, color: [f32; 4]);

    /// Compiles and registers a shader. Idempotent. A compile failure is
    /// degraded to the error shader and is not an error here.
    fn bind_shader(&mut self, shader: &Shader) -> RhiResult<()>;

    fn unbind_shader(&mut self, shader: &Shader) -> RhiResult<()>;

    /// False when the shader failed to compile and draws with the error
    /// shader instead.
    fn is_shader_valid(&self, shader: &Shader) -> bool;

    /// Creates the native texture and uploads host pixels. Idempotent;
    /// each bind adds one reference.
    fn bind_texture(&mut self, texture: &Texture) -> RhiResult<()>;

    fn unbind_texture(&mut self, texture: &Texture) -> RhiResult<()>;

    fn bind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()>;

    fn unbind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()>;

    /// Uploads the renderable's buffers, compiles its material's shaders if
    /// needed, and acquires state-cache entries for its fixed-function
    /// state. Idempotent for an already bound renderable.
    fn bind_renderable(&mut self, renderable: &mut Renderable) -> RhiResult<()>;

    /// Releases every state-cache entry and native resource the bind
    /// acquired. A no-op for an unbound renderable.
    fn unbind_renderable(&mut self, renderable: &Renderable) -> RhiResult<()>;

    fn is_renderable_bound(&self, renderable: &Renderable) -> bool;

    /// Records one draw: re-uploads dirty buffers, refreshes uniforms
    /// through the parameter binder, issues the (indexed) draw.
    fn draw(&mut self, renderable: &mut Renderable, frame: &FrameParams) -> RhiResult<()>;

    /// Set once the device is gone; the owner tears down and recreates.
    fn is_device_lost(&self) -> bool;

    fn stats(&self) -> BackendStats;
}

/// Instantiates the backend named by the configuration.
pub fn create_backend(
    config: &RhiConfig,
    surface: SurfaceTarget,
) -> RhiResult<Box<dyn RenderBackend>> {
    match config.backend {
        BackendKind::Headless => {
            log::info!("Using headless backend");
            Ok(Box::new(headless::HeadlessBackend::new(config, surface)?))
        }
        #[cfg(feature = "wgpu-backend")]
        BackendKind::Wgpu => {
            log::info!("Using wgpu backend");
            Ok(Box::new(wgpu_impl::WgpuBackend::new(config, surface)?))
        }
        #[cfg(feature = "vulkan-backend")]
        BackendKind::Vulkan => {
            log::info!("Using Vulkan backend");
            Ok(Box::new(vulkan::VulkanBackend::new(config, surface)?))
        }
        #[allow(unreachable_patterns)]
        other => Err(RhiError::InitializationFailed(format!(
            "backend {other:?} is not compiled into this build"
        ))),
    }
}
