//! Top-level device facade.
//!
//! `Rhi` owns one backend behind the `RenderBackend` trait and enforces the
//! frame lifecycle: exactly one frame is open between `begin_frame` and
//! `end_frame`, resource binding is allowed in either state, and resizing
//! only while idle. All per-draw parameter plumbing (world/view/projection,
//! camera, resolution) flows through here so renderables never talk to the
//! backend directly.

use glam::{Mat4, Vec3};

use crate::backend::{
    create_backend, BackendStats, FrameContext, RenderBackend, SurfaceTarget,
};
use crate::config::RhiConfig;
use crate::error::{RhiError, RhiResult};
use crate::params::FrameParams;
use crate::renderable::Renderable;
use crate::shader::Shader;
use crate::target::{RenderTarget, View};
use crate::texture::Texture;
use crate::types::ScissorRect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    FrameBegun,
}

pub struct Rhi {
    backend: Box<dyn RenderBackend>,
    state: FrameState,
    frame_params: FrameParams,
    frame: Option<FrameContext>,
}

impl Rhi {
    /// Creates the backend selected by `config.backend` and takes ownership
    /// of the surface.
    pub fn new(config: &RhiConfig, surface: SurfaceTarget) -> RhiResult<Self> {
        let backend = create_backend(config, surface)?;
        let (width, height) = backend.surface_size();
        let frame_params = FrameParams {
            resolution: glam::Vec2::new(width as f32, height as f32),
            ..FrameParams::default()
        };
        Ok(Self {
            backend,
            state: FrameState::Idle,
            frame_params,
            frame: None,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.backend.surface_size()
    }

    pub fn is_device_lost(&self) -> bool {
        self.backend.is_device_lost()
    }

    pub fn stats(&self) -> BackendStats {
        self.backend.stats()
    }

    /// Context of the frame currently open, if any.
    pub fn current_frame(&self) -> Option<&FrameContext> {
        self.frame.as_ref()
    }

    /// Resizes the surface. Only legal between frames.
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if self.state != FrameState::Idle {
            return Err(RhiError::FrameInFlight);
        }
        self.backend.resize(width, height)?;
        let (width, height) = self.backend.surface_size();
        self.frame_params.resolution = glam::Vec2::new(width as f32, height as f32);
        Ok(())
    }

    pub fn begin_frame(&mut self) -> RhiResult<()> {
        if self.state != FrameState::Idle {
            return Err(RhiError::FrameInFlight);
        }
        let frame = self.backend.begin_frame()?;
        log::trace!("frame {} begun (slot {})", frame.frame_index, frame.slot);
        self.frame = Some(frame);
        self.state = FrameState::FrameBegun;
        Ok(())
    }

    pub fn end_frame(&mut self) -> RhiResult<()> {
        if self.state != FrameState::FrameBegun {
            return Err(RhiError::FrameNotActive);
        }
        // State flips back to idle even when submission fails; the caller
        // decides whether the error is fatal, but the lifecycle stays sound.
        self.state = FrameState::Idle;
        self.frame = None;
        self.backend.end_frame()
    }

    /// Blocks until the device finished all submitted work.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.backend.wait_idle()
    }

    /// Directs subsequent draws into `view`'s target, or back to the
    /// surface for `None`.
    pub fn set_view(&mut self, view: Option<&View>) -> RhiResult<()> {
        if self.state != FrameState::FrameBegun {
            return Err(RhiError::FrameNotActive);
        }
        self.backend.set_view(view)
    }

    pub fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        self.backend.set_scissor(scissor);
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.backend.set_clear_color(color);
    }

    pub fn set_world_matrix(&mut self, world: Mat4) {
        self.frame_params.world = world;
    }

    pub fn set_view_projection(&mut self, view: Mat4, projection: Mat4) {
        self.frame_params.view = view;
        self.frame_params.projection = projection;
    }

    pub fn set_camera_position(&mut self, position: Vec3) {
        self.frame_params.camera_position = position;
    }

    pub fn frame_params(&self) -> &FrameParams {
        &self.frame_params
    }

    pub fn bind_shader(&mut self, shader: &Shader) -> RhiResult<()> {
        self.backend.bind_shader(shader)
    }

    pub fn unbind_shader(&mut self, shader: &Shader) -> RhiResult<()> {
        self.backend.unbind_shader(shader)
    }

    /// False when the shader was replaced by the error shader at bind.
    pub fn is_shader_valid(&self, shader: &Shader) -> bool {
        self.backend.is_shader_valid(shader)
    }

    pub fn bind_texture(&mut self, texture: &Texture) -> RhiResult<()> {
        self.backend.bind_texture(texture)
    }

    pub fn unbind_texture(&mut self, texture: &Texture) -> RhiResult<()> {
        self.backend.unbind_texture(texture)
    }

    pub fn bind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()> {
        self.backend.bind_render_target(target)
    }

    pub fn unbind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()> {
        self.backend.unbind_render_target(target)
    }

    pub fn bind_renderable(&mut self, renderable: &mut Renderable) -> RhiResult<()> {
        self.backend.bind_renderable(renderable)
    }

    pub fn unbind_renderable(&mut self, renderable: &Renderable) -> RhiResult<()> {
        self.backend.unbind_renderable(renderable)
    }

    pub fn is_renderable_bound(&self, renderable: &Renderable) -> bool {
        self.backend.is_renderable_bound(renderable)
    }

    /// Draws a renderable with the current frame parameters, binding it
    /// first if the caller has not.
    pub fn render_mesh(&mut self, renderable: &mut Renderable) -> RhiResult<()> {
        if self.state != FrameState::FrameBegun {
            return Err(RhiError::FrameNotActive);
        }
        if !self.backend.is_renderable_bound(renderable) {
            self.backend.bind_renderable(renderable)?;
        }
        self.backend.draw(renderable, &self.frame_params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headless_rhi() -> Rhi {
        let config = RhiConfig::default();
        match Rhi::new(&config, SurfaceTarget::offscreen(64, 64)) {
            Ok(rhi) => rhi,
            Err(e) => panic!("headless init failed: {e}"),
        }
    }

    #[test]
    fn test_frame_lifecycle() {
        let mut rhi = headless_rhi();
        assert!(rhi.begin_frame().is_ok());
        assert_eq!(rhi.begin_frame(), Err(RhiError::FrameInFlight));
        assert!(rhi.end_frame().is_ok());
        assert_eq!(rhi.end_frame(), Err(RhiError::FrameNotActive));
    }

    #[test]
    fn test_resize_requires_idle() {
        let mut rhi = headless_rhi();
        rhi.begin_frame().unwrap();
        assert_eq!(rhi.resize(128, 128), Err(RhiError::FrameInFlight));
        rhi.end_frame().unwrap();
        assert!(rhi.resize(128, 128).is_ok());
        assert_eq!(rhi.surface_size(), (128, 128));
    }

    #[test]
    fn test_set_view_requires_active_frame() {
        let mut rhi = headless_rhi();
        assert_eq!(rhi.set_view(None), Err(RhiError::FrameNotActive));
    }

    #[test]
    fn test_resolution_tracks_surface() {
        let mut rhi = headless_rhi();
        rhi.resize(320, 200).unwrap();
        assert_eq!(rhi.frame_params().resolution, glam::Vec2::new(320.0, 200.0));
    }
}
