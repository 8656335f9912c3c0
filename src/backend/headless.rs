//! Headless backend: a software simulation of the full backend contract.
//!
//! Native objects are plain integers, fences are atomics, and nothing talks
//! to a GPU, but the arenas, state caches, dirty tracking and frame
//! lifecycle behave exactly like the hardware backends. This is the default
//! backend and the one the contract tests run against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::backend::{
    BackendStats, FrameContext, RenderBackend, ResourceId, SurfaceTarget,
};
use crate::config::RhiConfig;
use crate::error::{RhiError, RhiResult};
use crate::params::{FrameParams, ParameterBinder};
use crate::renderable::Renderable;
use crate::shader::{compile_shader, ReflectedLayout, Shader, ERROR_SHADER_SOURCE};
use crate::state_cache::{
    BlendKey, DepthStencilKey, InputLayoutKey, RasterizerKey, SamplerKey, StateCache,
};
use crate::target::{RenderTarget, View};
use crate::texture::Texture;
use crate::types::{BufferUsage, ScissorRect};

/// Simulated GPU fence. Starts signaled so the first frame never waits.
struct SimFence {
    signaled: AtomicBool,
}

impl SimFence {
    fn new_signaled() -> Self {
        Self {
            signaled: AtomicBool::new(true),
        }
    }

    fn reset(&self) {
        self.signaled.store(false, Ordering::SeqCst);
    }

    fn signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
    }

    /// Polls until signaled or the timeout elapses.
    fn wait(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.signaled.load(Ordering::SeqCst) {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

struct BufferRecord {
    native: u64,
    size_bytes: u64,
}

struct TextureRecord {
    native: u64,
    refcount: u32,
}

struct ShaderRecord {
    native: u64,
    refcount: u32,
    /// False when the source failed to compile and the error shader stands
    /// in for it.
    valid: bool,
    layout: ReflectedLayout,
}

struct TargetRecord {
    refcount: u32,
    attachments: Vec<ResourceId>,
}

/// Everything a bound renderable acquired; released wholesale on unbind.
struct RenderableRecord {
    vertex_buffer: ResourceId,
    index_buffer: Option<ResourceId>,
    shader_ids: [ResourceId; 2],
    texture_ids: Vec<ResourceId>,
    sampler_keys: Vec<SamplerKey>,
    rasterizer: RasterizerKey,
    blend: BlendKey,
    depth_stencil: DepthStencilKey,
    input_layout: InputLayoutKey,
    binder: ParameterBinder,
}

pub struct HeadlessBackend {
    width: u32,
    height: u32,
    clear_color: [f32; 4],
    scissor: Option<ScissorRect>,
    active_view_slot: Option<u32>,

    frames_in_flight: usize,
    fence_timeout: Duration,
    fences: Vec<SimFence>,
    frame_index: u64,
    frame_active: bool,
    device_lost: bool,

    next_native: u64,
    buffers: HashMap<ResourceId, BufferRecord>,
    textures: HashMap<ResourceId, TextureRecord>,
    shaders: HashMap<ResourceId, ShaderRecord>,
    targets: HashMap<ResourceId, TargetRecord>,
    renderables: HashMap<ResourceId, RenderableRecord>,

    rasterizer_cache: StateCache<RasterizerKey, u64>,
    blend_cache: StateCache<BlendKey, u64>,
    depth_stencil_cache: StateCache<DepthStencilKey, u64>,
    input_layout_cache: StateCache<InputLayoutKey, u64>,
    sampler_cache: StateCache<SamplerKey, u64>,

    error_shader_layout: ReflectedLayout,
    buffer_uploads: u64,
    uniform_uploads: u64,
    draw_calls: u64,
    error_shader_substitutions: u64,
}

impl HeadlessBackend {
    pub fn new(config: &RhiConfig, surface: SurfaceTarget) -> RhiResult<Self> {
        let (width, height) = match surface {
            SurfaceTarget::Offscreen { width, height } => (width, height),
            SurfaceTarget::Window(window) => {
                let size = window.inner_size();
                (size.width.max(1), size.height.max(1))
            }
        };
        let frames_in_flight = config.frames_in_flight_clamped();
        let fences = (0..frames_in_flight)
            .map(|_| SimFence::new_signaled())
            .collect();

        // The fallback must compile; a failure here is an init bug, not a
        // degradable user error.
        let error_vs = compile_shader(&Shader::vertex("error-shader", ERROR_SHADER_SOURCE))
            .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;
        let error_shader_layout = error_vs.layout;

        log::info!("Headless backend: {width}x{height}, {frames_in_flight} frames in flight");
        Ok(Self {
            width,
            height,
            clear_color: config.clear_color,
            scissor: None,
            active_view_slot: None,
            frames_in_flight,
            fence_timeout: config.fence_timeout,
            fences,
            frame_index: 0,
            frame_active: false,
            device_lost: false,
            next_native: 0,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            targets: HashMap::new(),
            renderables: HashMap::new(),
            rasterizer_cache: StateCache::new(),
            blend_cache: StateCache::new(),
            depth_stencil_cache: StateCache::new(),
            input_layout_cache: StateCache::new(),
            sampler_cache: StateCache::new(),
            error_shader_layout,
            buffer_uploads: 0,
            uniform_uploads: 0,
            draw_calls: 0,
            error_shader_substitutions: 0,
        })
    }

    fn alloc_native(next: &mut u64) -> u64 {
        *next += 1;
        *next
    }

    fn retain_shader(&mut self, shader: &Shader) {
        if let Some(record) = self.shaders.get_mut(&shader.id()) {
            record.refcount += 1;
            return;
        }
        let (valid, layout) = match compile_shader(shader) {
            Ok(module) => (true, module.layout),
            Err(e) => {
                log::warn!(
                    "shader '{}' failed to compile, using error shader: {e}",
                    shader.name()
                );
                self.error_shader_substitutions += 1;
                (false, self.error_shader_layout.clone())
            }
        };
        let native = Self::alloc_native(&mut self.next_native);
        log::trace!("compiled shader '{}' -> native {native}", shader.name());
        self.shaders.insert(
            shader.id(),
            ShaderRecord {
                native,
                refcount: 1,
                valid,
                layout,
            },
        );
    }

    fn release_shader(&mut self, id: ResourceId) {
        match self.shaders.get_mut(&id) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                self.shaders.remove(&id);
                log::trace!("destroyed shader module for {id:?}");
            }
            None => log::warn!("release of unbound shader {id:?}"),
        }
    }

    fn retain_texture(&mut self, texture: &Texture) {
        if let Some(record) = self.textures.get_mut(&texture.id()) {
            record.refcount += 1;
            return;
        }
        let native = Self::alloc_native(&mut self.next_native);
        if texture.pixels().is_some() {
            self.buffer_uploads += 1;
        }
        log::trace!(
            "created texture {}x{} {:?} -> native {native}",
            texture.width(),
            texture.height(),
            texture.format()
        );
        self.textures.insert(
            texture.id(),
            TextureRecord {
                native,
                refcount: 1,
            },
        );
    }

    fn release_texture(&mut self, id: ResourceId) {
        match self.textures.get_mut(&id) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                self.textures.remove(&id);
                log::trace!("destroyed texture for {id:?}");
            }
            None => log::warn!("release of unbound texture {id:?}"),
        }
    }

    fn upload_buffer(&mut self, id: ResourceId, size_bytes: u64) {
        let native = Self::alloc_native(&mut self.next_native);
        self.buffer_uploads += 1;
        self.buffers.insert(id, BufferRecord { native, size_bytes });
    }
}

impl RenderBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        debug_assert!(!self.frame_active);
        self.wait_idle()?;
        self.width = width.max(1);
        self.height = height.max(1);
        log::trace!("resized to {}x{}", self.width, self.height);
        Ok(())
    }

    fn begin_frame(&mut self) -> RhiResult<FrameContext> {
        if self.device_lost {
            return Err(RhiError::DeviceLost);
        }
        let slot = (self.frame_index % self.frames_in_flight as u64) as usize;
        if !self.fences[slot].wait(self.fence_timeout) {
            self.device_lost = true;
            return Err(RhiError::DeviceLost);
        }
        self.fences[slot].reset();
        self.frame_active = true;
        log::trace!("begin frame {} (slot {slot})", self.frame_index);
        Ok(FrameContext {
            frame_index: self.frame_index,
            slot,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> RhiResult<()> {
        let slot = (self.frame_index % self.frames_in_flight as u64) as usize;
        // Submission completes immediately in simulation.
        self.fences[slot].signal();
        self.frame_active = false;
        self.frame_index += 1;
        self.active_view_slot = None;
        log::trace!("end frame");
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        for fence in &self.fences {
            if !fence.wait(self.fence_timeout) {
                self.device_lost = true;
                return Err(RhiError::DeviceLost);
            }
        }
        Ok(())
    }

    fn set_view(&mut self, view: Option<&View>) -> RhiResult<()> {
        match view {
            Some(view) => {
                if let Some(target) = view.target() {
                    // Lazy-bind the target the first time it is used.
                    if !self.targets.contains_key(&target.id()) {
                        self.bind_render_target(target)?;
                    }
                }
                self.active_view_slot = Some(view.slot());
                log::trace!("view slot {} active", view.slot());
            }
            None => {
                self.active_view_slot = None;
            }
        }
        Ok(())
    }

    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        self.scissor = scissor;
    }

    fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    fn bind_shader(&mut self, shader: &Shader) -> RhiResult<()> {
        self.retain_shader(shader);
        Ok(())
    }

    fn unbind_shader(&mut self, shader: &Shader) -> RhiResult<()> {
        self.release_shader(shader.id());
        Ok(())
    }

    fn is_shader_valid(&self, shader: &Shader) -> bool {
        self.shaders.get(&shader.id()).is_some_and(|r| r.valid)
    }

    fn bind_texture(&mut self, texture: &Texture) -> RhiResult<()> {
        self.retain_texture(texture);
        Ok(())
    }

    fn unbind_texture(&mut self, texture: &Texture) -> RhiResult<()> {
        self.release_texture(texture.id());
        Ok(())
    }

    fn bind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()> {
        if let Some(record) = self.targets.get_mut(&target.id()) {
            record.refcount += 1;
            return Ok(());
        }
        let mut attachments = Vec::new();
        for texture in target
            .color_attachments()
            .iter()
            .chain(target.depth_attachment())
        {
            self.retain_texture(texture);
            attachments.push(texture.id());
        }
        self.targets.insert(
            target.id(),
            TargetRecord {
                refcount: 1,
                attachments,
            },
        );
        Ok(())
    }

    fn unbind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()> {
        match self.targets.get_mut(&target.id()) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                if let Some(record) = self.targets.remove(&target.id()) {
                    for id in record.attachments {
                        self.release_texture(id);
                    }
                }
            }
            None => log::warn!("release of unbound render target {:?}", target.id()),
        }
        Ok(())
    }

    fn bind_renderable(&mut self, renderable: &mut Renderable) -> RhiResult<()> {
        if self.renderables.contains_key(&renderable.id()) {
            return Ok(());
        }
        let material = renderable.material().clone();
        let state = material.render_state();

        self.retain_shader(material.vertex_shader());
        self.retain_shader(material.fragment_shader());
        let shader_ids = [
            material.vertex_shader().id(),
            material.fragment_shader().id(),
        ];

        if let Some(record) = self.shaders.get(&shader_ids[0]) {
            if let Err(e) = record.layout.check_vertex_layout(renderable.mesh().layout()) {
                self.release_shader(shader_ids[0]);
                self.release_shader(shader_ids[1]);
                return Err(e);
            }
        }

        let mut texture_ids = Vec::new();
        let mut sampler_keys = Vec::new();
        for binding in material.textures() {
            self.retain_texture(&binding.texture);
            texture_ids.push(binding.texture.id());
            let key = SamplerKey::pack(&binding.sampler);
            let next = &mut self.next_native;
            self.sampler_cache
                .acquire(key, || Ok(Self::alloc_native(next)))?;
            sampler_keys.push(key);
        }

        let rasterizer = RasterizerKey::from_state(state);
        let blend = BlendKey::from_state(state);
        let depth_stencil = DepthStencilKey::from_state(state);
        let input_layout = InputLayoutKey::pack(renderable.mesh().layout());
        {
            let next = &mut self.next_native;
            self.rasterizer_cache
                .acquire(rasterizer, || Ok(Self::alloc_native(next)))?;
        }
        {
            let next = &mut self.next_native;
            self.blend_cache
                .acquire(blend, || Ok(Self::alloc_native(next)))?;
        }
        {
            let next = &mut self.next_native;
            self.depth_stencil_cache
                .acquire(depth_stencil, || Ok(Self::alloc_native(next)))?;
        }
        {
            let next = &mut self.next_native;
            self.input_layout_cache
                .acquire(input_layout, || Ok(Self::alloc_native(next)))?;
        }

        let mesh = renderable.mesh_mut();
        let vertex_buffer = mesh.vertex_buffer().id();
        self.upload_buffer(vertex_buffer, mesh.vertex_buffer().size_bytes());
        mesh.vertex_buffer_mut().mark_clean();
        let index_info = mesh.index_buffer().map(|i| (i.id(), i.size_bytes()));
        let index_buffer = if let Some((id, size)) = index_info {
            self.upload_buffer(id, size);
            if let Some(indices) = mesh.index_buffer_mut() {
                indices.mark_clean();
            }
            Some(id)
        } else {
            None
        };

        let layouts: Vec<&ReflectedLayout> = shader_ids
            .iter()
            .filter_map(|id| self.shaders.get(id).map(|r| &r.layout))
            .collect();
        let mut binder = ParameterBinder::new(&layouts);
        for (name, value) in material.params() {
            binder.set_param(name, value.as_bytes());
        }

        log::trace!("bound renderable {:?}", renderable.id());
        self.renderables.insert(
            renderable.id(),
            RenderableRecord {
                vertex_buffer,
                index_buffer,
                shader_ids,
                texture_ids,
                sampler_keys,
                rasterizer,
                blend,
                depth_stencil,
                input_layout,
                binder,
            },
        );
        Ok(())
    }

    fn unbind_renderable(&mut self, renderable: &Renderable) -> RhiResult<()> {
        let Some(record) = self.renderables.remove(&renderable.id()) else {
            return Ok(());
        };
        self.rasterizer_cache.release(record.rasterizer, |native| {
            log::trace!("destroyed rasterizer state {native}");
        });
        self.blend_cache.release(record.blend, |native| {
            log::trace!("destroyed blend state {native}");
        });
        self.depth_stencil_cache
            .release(record.depth_stencil, |native| {
                log::trace!("destroyed depth-stencil state {native}");
            });
        self.input_layout_cache
            .release(record.input_layout, |native| {
                log::trace!("destroyed input layout {native}");
            });
        for key in record.sampler_keys {
            self.sampler_cache.release(key, |native| {
                log::trace!("destroyed sampler {native}");
            });
        }
        for id in record.texture_ids {
            self.release_texture(id);
        }
        for id in record.shader_ids {
            self.release_shader(id);
        }
        self.buffers.remove(&record.vertex_buffer);
        if let Some(id) = record.index_buffer {
            self.buffers.remove(&id);
        }
        log::trace!("unbound renderable {:?}", renderable.id());
        Ok(())
    }

    fn is_renderable_bound(&self, renderable: &Renderable) -> bool {
        self.renderables.contains_key(&renderable.id())
    }

    fn draw(&mut self, renderable: &mut Renderable, frame: &FrameParams) -> RhiResult<()> {
        let Some(record) = self.renderables.get_mut(&renderable.id()) else {
            debug_assert!(false, "draw of unbound renderable");
            log::warn!("draw of unbound renderable {:?}, skipping", renderable.id());
            return Ok(());
        };

        let mesh = renderable.mesh_mut();
        if mesh.vertex_buffer().is_dirty() {
            if mesh.vertex_buffer().usage().contains(BufferUsage::DYNAMIC) {
                self.buffer_uploads += 1;
            } else {
                log::warn!("static vertex buffer marked dirty after initial upload, ignoring");
            }
            mesh.vertex_buffer_mut().mark_clean();
        }
        if let Some(indices) = mesh.index_buffer_mut() {
            if indices.is_dirty() {
                if indices.usage().contains(BufferUsage::DYNAMIC) {
                    self.buffer_uploads += 1;
                } else {
                    log::warn!("static index buffer marked dirty after initial upload, ignoring");
                }
                indices.mark_clean();
            }
        }

        record.binder.set_frame_params(frame);
        let uploaded = record.binder.flush(|layout, _bytes| {
            log::trace!("uploaded uniform buffer '{}'", layout.name);
        });
        self.uniform_uploads += uploaded as u64;

        self.draw_calls += 1;
        log::trace!(
            "draw {:?}: {} elements (view slot {:?})",
            renderable.id(),
            renderable.mesh().draw_count(),
            self.active_view_slot
        );
        Ok(())
    }

    fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            rasterizer_states: self.rasterizer_cache.len(),
            blend_states: self.blend_cache.len(),
            depth_stencil_states: self.depth_stencil_cache.len(),
            input_layouts: self.input_layout_cache.len(),
            samplers: self.sampler_cache.len(),
            pipelines: 0,
            buffer_uploads: self.buffer_uploads,
            uniform_uploads: self.uniform_uploads,
            draw_calls: self.draw_calls,
            error_shader_substitutions: self.error_shader_substitutions,
        }
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        if !self.renderables.is_empty() {
            log::warn!(
                "headless backend dropped with {} renderables still bound",
                self.renderables.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_starts_signaled() {
        let fence = SimFence::new_signaled();
        assert!(fence.wait(Duration::from_millis(1)));
        fence.reset();
        assert!(!fence.wait(Duration::from_millis(5)));
        fence.signal();
        assert!(fence.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_frame_lifecycle() {
        let config = RhiConfig::default();
        let mut backend =
            HeadlessBackend::new(&config, SurfaceTarget::offscreen(640, 480)).unwrap();
        for expected in 0..4u64 {
            let ctx = backend.begin_frame().unwrap();
            assert_eq!(ctx.frame_index, expected);
            assert_eq!(ctx.slot, (expected % 2) as usize);
            backend.end_frame().unwrap();
        }
    }

    #[test]
    fn test_fence_timeout_marks_device_lost() {
        let config = RhiConfig {
            fence_timeout: Duration::from_millis(5),
            frames_in_flight: 1,
            ..RhiConfig::default()
        };
        let mut backend =
            HeadlessBackend::new(&config, SurfaceTarget::offscreen(64, 64)).unwrap();
        let _ = backend.begin_frame().unwrap();
        // Simulate a stuck GPU: the slot fence never signals.
        backend.fences[0].reset();
        backend.frame_index += 1;
        assert_eq!(backend.begin_frame(), Err(RhiError::DeviceLost));
        assert!(backend.is_device_lost());
    }
}
