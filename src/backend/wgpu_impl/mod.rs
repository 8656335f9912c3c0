//! wgpu backend.
//!
//! Middleware backend: wgpu owns device/queue synchronization, so frames in
//! flight are implicit. Fixed-function state has no standalone native
//! objects here; the rasterizer/blend/depth-stencil/input-layout keys fold
//! into one pipeline key and whole pipelines are deduplicated through the
//! same refcounted cache. Draws are buffered per pass and replayed into
//! render passes at `end_frame`.
//!
//! Binding convention: uniform buffers live in `@group(0)`, material
//! textures in `@group(1)` as pairs (`@binding(2*slot)` texture,
//! `@binding(2*slot+1)` sampler).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::backend::{
    BackendStats, FrameContext, RenderBackend, ResourceId, SurfaceTarget,
};
use crate::config::RhiConfig;
use crate::error::{RhiError, RhiResult};
use crate::mesh::{VertexAttributeFormat, VertexLayout};
use crate::params::{FrameParams, ParameterBinder};
use crate::renderable::Renderable;
use crate::shader::{
    compile_shader, ReflectedLayout, Shader, ShaderStage, ERROR_SHADER_SOURCE,
};
use crate::state_cache::{
    BlendKey, DepthStencilKey, InputLayoutKey, RasterizerKey, SamplerKey, StateCache,
};
use crate::target::{RenderTarget, View};
use crate::texture::Texture;
use crate::types::{
    AddressMode, BlendComponent, BlendFactor, BlendOperation, BufferUsage, ColorWrites,
    CompareFunction, CullMode, FilterMode, FrontFace, RenderState, SamplerDescriptor,
    ScissorRect, StencilOperation, TextureFormat, Viewport,
};

const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

fn convert_cull_mode(mode: CullMode) -> Option<wgpu::Face> {
    match mode {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    }
}

fn convert_front_face(face: FrontFace) -> wgpu::FrontFace {
    match face {
        FrontFace::Ccw => wgpu::FrontFace::Ccw,
        FrontFace::Cw => wgpu::FrontFace::Cw,
    }
}

fn convert_compare(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::Src => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Dst => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
    match op {
        BlendOperation::Add => wgpu::BlendOperation::Add,
        BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
        BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOperation::Min => wgpu::BlendOperation::Min,
        BlendOperation::Max => wgpu::BlendOperation::Max,
    }
}

fn convert_blend_component(component: &BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: convert_blend_factor(component.src_factor),
        dst_factor: convert_blend_factor(component.dst_factor),
        operation: convert_blend_operation(component.operation),
    }
}

fn convert_stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
    match op {
        StencilOperation::Keep => wgpu::StencilOperation::Keep,
        StencilOperation::Zero => wgpu::StencilOperation::Zero,
        StencilOperation::Replace => wgpu::StencilOperation::Replace,
        StencilOperation::Invert => wgpu::StencilOperation::Invert,
        StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOperation::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        StencilOperation::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOperation::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
    }
}

fn convert_color_writes(mask: ColorWrites) -> wgpu::ColorWrites {
    let mut out = wgpu::ColorWrites::empty();
    if mask.contains(ColorWrites::RED) {
        out |= wgpu::ColorWrites::RED;
    }
    if mask.contains(ColorWrites::GREEN) {
        out |= wgpu::ColorWrites::GREEN;
    }
    if mask.contains(ColorWrites::BLUE) {
        out |= wgpu::ColorWrites::BLUE;
    }
    if mask.contains(ColorWrites::ALPHA) {
        out |= wgpu::ColorWrites::ALPHA;
    }
    out
}

fn convert_filter(filter: FilterMode) -> wgpu::FilterMode {
    match filter {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
    }
}

fn convert_vertex_format(format: VertexAttributeFormat) -> RhiResult<wgpu::VertexFormat> {
    match format {
        VertexAttributeFormat::Float32 => Ok(wgpu::VertexFormat::Float32),
        VertexAttributeFormat::Float32x2 => Ok(wgpu::VertexFormat::Float32x2),
        VertexAttributeFormat::Float32x3 => Ok(wgpu::VertexFormat::Float32x3),
        VertexAttributeFormat::Float32x4 => Ok(wgpu::VertexFormat::Float32x4),
        VertexAttributeFormat::Unorm8x2 => Ok(wgpu::VertexFormat::Unorm8x2),
        VertexAttributeFormat::Unorm8x4 => Ok(wgpu::VertexFormat::Unorm8x4),
        // wgpu has no single-component unorm8 vertex format.
        VertexAttributeFormat::Unorm8 => Err(RhiError::PipelineCreationFailed(
            "single-component unorm8 vertex attributes are unsupported by wgpu".to_string(),
        )),
    }
}

/// Combined pipeline identity. Two renderables with identical fixed-function
/// state, shaders, layout and target formats share one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    rasterizer: RasterizerKey,
    blend: BlendKey,
    depth_stencil: DepthStencilKey,
    input_layout: InputLayoutKey,
    vs: ResourceId,
    fs: ResourceId,
    color_format: TextureFormat,
    depth_format: Option<TextureFormat>,
}

struct ShaderRecord {
    module: wgpu::ShaderModule,
    entry_point: String,
    valid: bool,
    layout: ReflectedLayout,
    refcount: u32,
}

struct TextureRecord {
    _texture: wgpu::Texture,
    view: Arc<wgpu::TextureView>,
    format: TextureFormat,
    refcount: u32,
}

struct TargetRecord {
    refcount: u32,
    color: Vec<ResourceId>,
    depth: Option<ResourceId>,
    color_format: TextureFormat,
    depth_format: Option<TextureFormat>,
}

struct UniformSlot {
    group: u32,
    binding: u32,
    buffer: Arc<wgpu::Buffer>,
}

struct RenderableRecord {
    vertex_buffer: ResourceId,
    index_buffer: Option<(ResourceId, wgpu::IndexFormat)>,
    draw_count: u32,
    vertex_layout: VertexLayout,
    render_state: RenderState,
    shader_ids: [ResourceId; 2],
    texture_ids: Vec<ResourceId>,
    sampler_keys: Vec<SamplerKey>,
    uniforms: Vec<UniformSlot>,
    binder: ParameterBinder,
    /// Pipeline cache keys acquired so far (one ref each).
    pipelines: Vec<PipelineKey>,
    bind_groups: HashMap<PipelineKey, (Arc<wgpu::BindGroup>, Option<Arc<wgpu::BindGroup>>)>,
}

struct DrawCmd {
    pipeline: Arc<wgpu::RenderPipeline>,
    bind0: Arc<wgpu::BindGroup>,
    bind1: Option<Arc<wgpu::BindGroup>>,
    vertex_buffer: ResourceId,
    index_buffer: Option<(ResourceId, wgpu::IndexFormat)>,
    draw_count: u32,
}

struct PassGroup {
    target: Option<ResourceId>,
    viewport: Viewport,
    scissor: Option<ScissorRect>,
    draws: Vec<DrawCmd>,
}

struct ActiveFrame {
    surface_texture: Option<wgpu::SurfaceTexture>,
    surface_view: wgpu::TextureView,
    frame_index: u64,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: Option<wgpu::Surface<'static>>,
    surface_config: Option<wgpu::SurfaceConfiguration>,
    surface_format: TextureFormat,
    /// Offscreen color store when running without a window.
    offscreen_color: Option<(wgpu::Texture, wgpu::TextureView)>,
    depth_view: wgpu::TextureView,
    width: u32,
    height: u32,
    max_dimension: u32,
    clear_color: [f32; 4],

    frame: Option<ActiveFrame>,
    frame_index: u64,
    passes: Vec<PassGroup>,
    device_lost: bool,

    buffers: HashMap<ResourceId, wgpu::Buffer>,
    textures: HashMap<ResourceId, TextureRecord>,
    shaders: HashMap<ResourceId, ShaderRecord>,
    targets: HashMap<ResourceId, TargetRecord>,
    renderables: HashMap<ResourceId, RenderableRecord>,
    pipeline_cache: StateCache<PipelineKey, Arc<wgpu::RenderPipeline>>,
    sampler_cache: StateCache<SamplerKey, Arc<wgpu::Sampler>>,

    buffer_uploads: u64,
    uniform_uploads: u64,
    draw_calls: u64,
    error_shader_substitutions: u64,
}

impl WgpuBackend {
    pub fn new(config: &RhiConfig, surface_target: SurfaceTarget) -> RhiResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let (surface, width, height) = match &surface_target {
            SurfaceTarget::Window(window) => {
                let size = window.inner_size();
                let surface = instance.create_surface(window.clone()).map_err(|e| {
                    RhiError::SurfaceCreationFailed(e.to_string())
                })?;
                (Some(surface), size.width.max(1), size.height.max(1))
            }
            SurfaceTarget::Offscreen { width, height } => (None, (*width).max(1), (*height).max(1)),
        };

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface.as_ref(),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RhiError::InitializationFailed("no compatible adapter".to_string()))?;

        log::info!("wgpu adapter: {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("rhi-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|e| RhiError::DeviceCreationFailed(e.to_string()))?;

        let max_dimension = device.limits().max_texture_dimension_2d;

        let (surface_config, surface_format) = match &surface {
            Some(surface) => {
                let caps = surface.get_capabilities(&adapter);
                let format = caps
                    .formats
                    .iter()
                    .copied()
                    .find(|f| *f == wgpu::TextureFormat::Bgra8Unorm)
                    .unwrap_or(caps.formats[0]);
                let present_mode = if config.vsync {
                    wgpu::PresentMode::Fifo
                } else if caps.present_modes.contains(&wgpu::PresentMode::Immediate) {
                    wgpu::PresentMode::Immediate
                } else {
                    wgpu::PresentMode::Fifo
                };
                let surface_config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width,
                    height,
                    present_mode,
                    desired_maximum_frame_latency: config.frames_in_flight_clamped() as u32,
                    alpha_mode: caps.alpha_modes[0],
                    view_formats: vec![],
                };
                surface.configure(&device, &surface_config);
                let abstract_format = match format {
                    wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
                    wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
                    _ => TextureFormat::Rgba8Unorm,
                };
                (Some(surface_config), abstract_format)
            }
            None => (None, TextureFormat::Rgba8Unorm),
        };

        let offscreen_color = if surface.is_none() {
            Some(Self::create_offscreen_color(&device, width, height))
        } else {
            None
        };
        let depth_view = Self::create_depth(&device, width, height);

        log::info!("wgpu backend: {width}x{height}, surface format {surface_format:?}");
        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            surface_format,
            offscreen_color,
            depth_view,
            width,
            height,
            max_dimension,
            clear_color: config.clear_color,
            frame: None,
            frame_index: 0,
            passes: Vec::new(),
            device_lost: false,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            targets: HashMap::new(),
            renderables: HashMap::new(),
            pipeline_cache: StateCache::new(),
            sampler_cache: StateCache::new(),
            buffer_uploads: 0,
            uniform_uploads: 0,
            draw_calls: 0,
            error_shader_substitutions: 0,
        })
    }

    fn create_offscreen_color(
        device: &wgpu::Device,
        width: u32,
        height: u32,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("rhi-offscreen-color"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    fn create_depth(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("rhi-depth"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: convert_texture_format(DEPTH_FORMAT),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    fn retain_shader(&mut self, shader: &Shader) {
        if let Some(record) = self.shaders.get_mut(&shader.id()) {
            record.refcount += 1;
            return;
        }
        // Pre-validate with naga so an invalid source never reaches the
        // device; failures degrade to the error shader.
        let (valid, layout, source) = match compile_shader(shader) {
            Ok(module) => (true, module.layout, shader.preprocessed_source()),
            Err(e) => {
                log::warn!(
                    "shader '{}' failed to compile, using error shader: {e}",
                    shader.name()
                );
                self.error_shader_substitutions += 1;
                let fallback = Shader::new(shader.name(), shader.stage(), ERROR_SHADER_SOURCE);
                match compile_shader(&fallback) {
                    Ok(module) => (false, module.layout, ERROR_SHADER_SOURCE.to_string()),
                    Err(e) => {
                        // The constant fallback source failing is an init
                        // bug; keep a hollow record rather than unwinding.
                        log::error!("error shader failed to compile: {e}");
                        (false, ReflectedLayout::default(), ERROR_SHADER_SOURCE.to_string())
                    }
                }
            }
        };
        let entry_point = if valid {
            shader.entry_point().to_string()
        } else {
            match shader.stage() {
                ShaderStage::Vertex => "vs_main".to_string(),
                ShaderStage::Fragment => "fs_main".to_string(),
            }
        };
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(shader.name()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        self.shaders.insert(
            shader.id(),
            ShaderRecord {
                module,
                entry_point,
                valid,
                layout,
                refcount: 1,
            },
        );
    }

    fn release_shader(&mut self, id: ResourceId) {
        match self.shaders.get_mut(&id) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                self.shaders.remove(&id);
            }
            None => log::warn!("release of unbound shader {id:?}"),
        }
    }

    fn retain_texture(&mut self, texture: &Texture) {
        if let Some(record) = self.textures.get_mut(&texture.id()) {
            record.refcount += 1;
            return;
        }
        let format = convert_texture_format(texture.format());
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        if texture.pixels().is_none() {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let native = self.device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: texture.width(),
                height: texture.height(),
                depth_or_array_layers: 1,
            },
            mip_level_count: texture.mip_level_count(),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        if let Some(pixels) = texture.pixels() {
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &native,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                pixels,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(texture.width() * texture.format().bytes_per_pixel()),
                    rows_per_image: Some(texture.height()),
                },
                wgpu::Extent3d {
                    width: texture.width(),
                    height: texture.height(),
                    depth_or_array_layers: 1,
                },
            );
            self.buffer_uploads += 1;
        }
        let view = Arc::new(native.create_view(&wgpu::TextureViewDescriptor::default()));
        self.textures.insert(
            texture.id(),
            TextureRecord {
                _texture: native,
                view,
                format: texture.format(),
                refcount: 1,
            },
        );
    }

    fn release_texture(&mut self, id: ResourceId) {
        match self.textures.get_mut(&id) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                self.textures.remove(&id);
            }
            None => log::warn!("release of unbound texture {id:?}"),
        }
    }

    fn upload_buffer(&mut self, id: ResourceId, contents: &[u8], usage: wgpu::BufferUsages) {
        let buffer = self.buffers.entry(id).or_insert_with(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size: contents.len() as u64,
                usage: usage | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        self.queue.write_buffer(buffer, 0, contents);
        self.buffer_uploads += 1;
    }

    fn create_sampler(device: &wgpu::Device, desc: &SamplerDescriptor) -> Arc<wgpu::Sampler> {
        Arc::new(device.create_sampler(&wgpu::SamplerDescriptor {
            label: None,
            address_mode_u: convert_address_mode(desc.address_u),
            address_mode_v: convert_address_mode(desc.address_v),
            address_mode_w: convert_address_mode(desc.address_w),
            mag_filter: convert_filter(desc.mag_filter),
            min_filter: convert_filter(desc.min_filter),
            mipmap_filter: convert_filter(desc.mip_filter),
            compare: desc.compare.map(convert_compare),
            ..Default::default()
        }))
    }

    fn create_pipeline(
        device: &wgpu::Device,
        shaders: &HashMap<ResourceId, ShaderRecord>,
        key: &PipelineKey,
        vertex_layout: &VertexLayout,
        state: &RenderState,
    ) -> RhiResult<Arc<wgpu::RenderPipeline>> {
        let vs = shaders.get(&key.vs).ok_or_else(|| {
            RhiError::PipelineCreationFailed("vertex shader not bound".to_string())
        })?;
        let fs = shaders.get(&key.fs).ok_or_else(|| {
            RhiError::PipelineCreationFailed("fragment shader not bound".to_string())
        })?;

        let mut attributes = Vec::with_capacity(vertex_layout.attributes().len());
        for (i, attribute) in vertex_layout.attributes().iter().enumerate() {
            attributes.push(wgpu::VertexAttribute {
                format: convert_vertex_format(attribute.format)?,
                offset: vertex_layout.offset_of(i) as u64,
                shader_location: i as u32,
            });
        }
        let vertex_buffers = [wgpu::VertexBufferLayout {
            array_stride: vertex_layout.stride() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &attributes,
        }];

        let blend = state.blend.as_ref().map(|blend| wgpu::BlendState {
            color: convert_blend_component(&blend.color),
            alpha: convert_blend_component(&blend.alpha),
        });
        let stencil = match &state.stencil {
            Some(stencil) => {
                let face = wgpu::StencilFaceState {
                    compare: convert_compare(stencil.compare),
                    fail_op: convert_stencil_operation(stencil.fail_op),
                    depth_fail_op: convert_stencil_operation(stencil.depth_fail_op),
                    pass_op: convert_stencil_operation(stencil.pass_op),
                };
                wgpu::StencilState {
                    front: face,
                    back: face,
                    read_mask: stencil.read_mask as u32,
                    write_mask: stencil.write_mask as u32,
                }
            }
            None => wgpu::StencilState::default(),
        };
        let depth_stencil = key.depth_format.map(|format| wgpu::DepthStencilState {
            format: convert_texture_format(format),
            depth_write_enabled: state.depth_write,
            depth_compare: convert_compare(state.depth_compare),
            stencil,
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: None,
            layout: None,
            vertex: wgpu::VertexState {
                module: &vs.module,
                entry_point: &vs.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &vertex_buffers,
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: convert_front_face(state.front_face),
                cull_mode: convert_cull_mode(state.cull_mode),
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &fs.module,
                entry_point: &fs.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: convert_texture_format(key.color_format),
                    blend,
                    write_mask: convert_color_writes(state.color_write_mask),
                })],
            }),
            multiview: None,
        });
        Ok(Arc::new(pipeline))
    }

    /// Color/depth formats of the pass draws currently land in.
    fn active_pass_formats(&self) -> (TextureFormat, Option<TextureFormat>) {
        match self.passes.last().and_then(|p| p.target) {
            Some(target_id) => match self.targets.get(&target_id) {
                Some(target) => (target.color_format, target.depth_format),
                None => (self.surface_format, Some(DEPTH_FORMAT)),
            },
            None => (self.surface_format, Some(DEPTH_FORMAT)),
        }
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        debug_assert!(self.frame.is_none());
        // Clamp to device limits; an oversized maximized window otherwise
        // fails surface configuration.
        self.width = width.clamp(1, self.max_dimension);
        self.height = height.clamp(1, self.max_dimension);
        if let (Some(surface), Some(surface_config)) = (&self.surface, &mut self.surface_config) {
            surface_config.width = self.width;
            surface_config.height = self.height;
            surface.configure(&self.device, surface_config);
        }
        if self.offscreen_color.is_some() {
            self.offscreen_color = Some(Self::create_offscreen_color(
                &self.device,
                self.width,
                self.height,
            ));
        }
        self.depth_view = Self::create_depth(&self.device, self.width, self.height);
        Ok(())
    }

    fn begin_frame(&mut self) -> RhiResult<FrameContext> {
        if self.device_lost {
            return Err(RhiError::DeviceLost);
        }
        let (surface_texture, surface_view) = match (&self.surface, &self.offscreen_color) {
            (Some(surface), _) => {
                let texture = match surface.get_current_texture() {
                    Ok(texture) => texture,
                    Err(wgpu::SurfaceError::Outdated) | Err(wgpu::SurfaceError::Lost) => {
                        // One reconfigure-and-retry; a second failure is
                        // surfaced to the owner.
                        if let Some(surface_config) = &self.surface_config {
                            surface.configure(&self.device, surface_config);
                        }
                        surface
                            .get_current_texture()
                            .map_err(|e| RhiError::AcquireImageFailed(e.to_string()))?
                    }
                    Err(wgpu::SurfaceError::OutOfMemory) => {
                        self.device_lost = true;
                        return Err(RhiError::OutOfMemory);
                    }
                    Err(e) => return Err(RhiError::AcquireImageFailed(e.to_string())),
                };
                let view = texture
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                (Some(texture), view)
            }
            (None, Some((texture, _))) => {
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                (None, view)
            }
            (None, None) => {
                return Err(RhiError::Internal("no surface and no offscreen store".to_string()))
            }
        };

        self.frame = Some(ActiveFrame {
            surface_texture,
            surface_view,
            frame_index: self.frame_index,
        });
        self.passes.clear();
        self.passes.push(PassGroup {
            target: None,
            viewport: Viewport::from_extent(self.width, self.height),
            scissor: None,
            draws: Vec::new(),
        });
        Ok(FrameContext {
            frame_index: self.frame_index,
            slot: 0,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> RhiResult<()> {
        let Some(frame) = self.frame.take() else {
            return Err(RhiError::FrameNotActive);
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("rhi-frame"),
            });

        let clear = wgpu::Color {
            r: self.clear_color[0] as f64,
            g: self.clear_color[1] as f64,
            b: self.clear_color[2] as f64,
            a: self.clear_color[3] as f64,
        };
        // First pass touching an attachment clears it, later ones load.
        let mut cleared: HashSet<Option<ResourceId>> = HashSet::new();

        for group in self.passes.drain(..) {
            let first_use = cleared.insert(group.target);
            let load = if first_use {
                wgpu::LoadOp::Clear(clear)
            } else {
                wgpu::LoadOp::Load
            };

            let (color_view, depth_view): (&wgpu::TextureView, Option<&wgpu::TextureView>) =
                match group.target {
                    Some(target_id) => {
                        let Some(target) = self.targets.get(&target_id) else {
                            log::warn!("pass targets unbound render target, skipping");
                            continue;
                        };
                        let color = target
                            .color
                            .first()
                            .and_then(|id| self.textures.get(id))
                            .map(|t| t.view.as_ref());
                        let Some(color) = color else {
                            log::warn!("render target has no live color attachment, skipping");
                            continue;
                        };
                        let depth = target
                            .depth
                            .and_then(|id| self.textures.get(&id))
                            .map(|t| t.view.as_ref());
                        (color, depth)
                    }
                    None => (&frame.surface_view, Some(&self.depth_view)),
                };

            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: None,
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: depth_view.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: if first_use {
                                wgpu::LoadOp::Clear(1.0)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            let vp = group.viewport;
            pass.set_viewport(vp.x, vp.y, vp.width, vp.height, vp.min_depth, vp.max_depth);
            if let Some(scissor) = group.scissor {
                pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
            }

            for draw in &group.draws {
                let Some(vertex_buffer) = self.buffers.get(&draw.vertex_buffer) else {
                    log::warn!("draw references missing vertex buffer, skipping");
                    continue;
                };
                pass.set_pipeline(&draw.pipeline);
                pass.set_bind_group(0, &draw.bind0, &[]);
                if let Some(bind1) = &draw.bind1 {
                    pass.set_bind_group(1, bind1, &[]);
                }
                pass.set_vertex_buffer(0, vertex_buffer.slice(..));
                match &draw.index_buffer {
                    Some((id, index_format)) => {
                        let Some(index_buffer) = self.buffers.get(id) else {
                            log::warn!("draw references missing index buffer, skipping");
                            continue;
                        };
                        pass.set_index_buffer(index_buffer.slice(..), *index_format);
                        pass.draw_indexed(0..draw.draw_count, 0, 0..1);
                    }
                    None => pass.draw(0..draw.draw_count, 0..1),
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(surface_texture) = frame.surface_texture {
            surface_texture.present();
        }
        self.frame_index = frame.frame_index + 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn set_view(&mut self, view: Option<&View>) -> RhiResult<()> {
        let (target, viewport) = match view {
            Some(view) => {
                if let Some(target) = view.target() {
                    if !self.targets.contains_key(&target.id()) {
                        self.bind_render_target(target)?;
                    }
                }
                (view.target().map(|t| t.id()), view.viewport())
            }
            None => (None, Viewport::from_extent(self.width, self.height)),
        };
        self.passes.push(PassGroup {
            target,
            viewport,
            scissor: None,
            draws: Vec::new(),
        });
        Ok(())
    }

    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        if let Some(group) = self.passes.last_mut() {
            group.scissor = scissor;
        }
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
        let mut color = Vec::new();
        for texture in target.color_attachments() {
            self.retain_texture(texture);
            color.push(texture.id());
        }
        let depth = target.depth_attachment().map(|texture| {
            self.retain_texture(texture);
            texture.id()
        });
        let color_format = target
            .color_attachments()
            .first()
            .map(|t| t.format())
            .unwrap_or(self.surface_format);
        let depth_format = target.depth_attachment().map(|t| t.format());
        self.targets.insert(
            target.id(),
            TargetRecord {
                refcount: 1,
                color,
                depth,
                color_format,
                depth_format,
            },
        );
        Ok(())
    }

    fn unbind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()> {
        match self.targets.get_mut(&target.id()) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                if let Some(record) = self.targets.remove(&target.id()) {
                    for id in record.color.into_iter().chain(record.depth) {
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
            let device = &self.device;
            let desc = binding.sampler;
            self.sampler_cache
                .acquire(key, || Ok(Self::create_sampler(device, &desc)))?;
            sampler_keys.push(key);
        }

        let mesh = renderable.mesh_mut();
        let vertex_layout = mesh.layout().clone();
        let draw_count = mesh.draw_count();
        let vertex_id = mesh.vertex_buffer().id();
        let vertex_data = mesh.vertex_buffer().data().to_vec();
        self.upload_buffer(vertex_id, &vertex_data, wgpu::BufferUsages::VERTEX);
        mesh.vertex_buffer_mut().mark_clean();

        let index_buffer = match mesh.index_buffer() {
            Some(indices) => {
                let format = if indices.stride() == 2 {
                    wgpu::IndexFormat::Uint16
                } else {
                    wgpu::IndexFormat::Uint32
                };
                let id = indices.id();
                let data = indices.data().to_vec();
                self.upload_buffer(id, &data, wgpu::BufferUsages::INDEX);
                if let Some(indices) = mesh.index_buffer_mut() {
                    indices.mark_clean();
                }
                Some((id, format))
            }
            None => None,
        };

        let layouts: Vec<&ReflectedLayout> = shader_ids
            .iter()
            .filter_map(|id| self.shaders.get(id).map(|r| &r.layout))
            .collect();
        let mut binder = ParameterBinder::new(&layouts);
        for (name, value) in material.params() {
            binder.set_param(name, value.as_bytes());
        }
        let uniforms: Vec<UniformSlot> = binder
            .buffer_layouts()
            .map(|layout| UniformSlot {
                group: layout.group,
                binding: layout.binding,
                buffer: Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&layout.name),
                    size: layout.size_bytes.max(16) as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })),
            })
            .collect();

        self.renderables.insert(
            renderable.id(),
            RenderableRecord {
                vertex_buffer: vertex_id,
                index_buffer,
                draw_count,
                vertex_layout,
                render_state: *material.render_state(),
                shader_ids,
                texture_ids,
                sampler_keys,
                uniforms,
                binder,
                pipelines: Vec::new(),
                bind_groups: HashMap::new(),
            },
        );
        Ok(())
    }

    fn unbind_renderable(&mut self, renderable: &Renderable) -> RhiResult<()> {
        let Some(record) = self.renderables.remove(&renderable.id()) else {
            return Ok(());
        };
        for key in record.pipelines {
            self.pipeline_cache.release(key, |pipeline| drop(pipeline));
        }
        for key in record.sampler_keys {
            self.sampler_cache.release(key, |sampler| drop(sampler));
        }
        for id in record.texture_ids {
            self.release_texture(id);
        }
        for id in record.shader_ids {
            self.release_shader(id);
        }
        if let Some(buffer) = self.buffers.remove(&record.vertex_buffer) {
            buffer.destroy();
        }
        if let Some((id, _)) = record.index_buffer {
            if let Some(buffer) = self.buffers.remove(&id) {
                buffer.destroy();
            }
        }
        Ok(())
    }

    fn is_renderable_bound(&self, renderable: &Renderable) -> bool {
        self.renderables.contains_key(&renderable.id())
    }

    fn draw(&mut self, renderable: &mut Renderable, frame: &FrameParams) -> RhiResult<()> {
        if !self.renderables.contains_key(&renderable.id()) {
            debug_assert!(false, "draw of unbound renderable");
            log::warn!("draw of unbound renderable {:?}, skipping", renderable.id());
            return Ok(());
        }

        // Dirty dynamic buffers pick up the CPU copy before the draw.
        let mesh = renderable.mesh_mut();
        if mesh.vertex_buffer().is_dirty() {
            if mesh.vertex_buffer().usage().contains(BufferUsage::DYNAMIC) {
                let id = mesh.vertex_buffer().id();
                let data = mesh.vertex_buffer().data().to_vec();
                self.upload_buffer(id, &data, wgpu::BufferUsages::VERTEX);
            } else {
                log::warn!("static vertex buffer marked dirty after initial upload, ignoring");
            }
            mesh.vertex_buffer_mut().mark_clean();
        }
        if mesh.index_buffer().is_some_and(|i| i.is_dirty()) {
            let dynamic_data = mesh
                .index_buffer()
                .filter(|i| i.usage().contains(BufferUsage::DYNAMIC))
                .map(|i| (i.id(), i.data().to_vec()));
            match dynamic_data {
                Some((id, data)) => self.upload_buffer(id, &data, wgpu::BufferUsages::INDEX),
                None => {
                    log::warn!("static index buffer marked dirty after initial upload, ignoring")
                }
            }
            if let Some(indices) = mesh.index_buffer_mut() {
                indices.mark_clean();
            }
        }

        let (color_format, depth_format) = self.active_pass_formats();
        let record = match self.renderables.get_mut(&renderable.id()) {
            Some(record) => record,
            None => return Ok(()),
        };

        record.binder.set_frame_params(frame);
        let queue = &self.queue;
        let uniforms = &record.uniforms;
        let uploaded = record.binder.flush(|layout, bytes| {
            if let Some(slot) = uniforms
                .iter()
                .find(|u| (u.group, u.binding) == (layout.group, layout.binding))
            {
                queue.write_buffer(&slot.buffer, 0, bytes);
            }
        });
        self.uniform_uploads += uploaded as u64;

        let key = PipelineKey {
            rasterizer: RasterizerKey::from_state(&record.render_state),
            blend: BlendKey::from_state(&record.render_state),
            depth_stencil: DepthStencilKey::from_state(&record.render_state),
            input_layout: InputLayoutKey::pack(&record.vertex_layout),
            vs: record.shader_ids[0],
            fs: record.shader_ids[1],
            color_format,
            depth_format,
        };

        let pipeline = if record.pipelines.contains(&key) {
            match self.pipeline_cache.get(key) {
                Some(pipeline) => pipeline,
                None => return Ok(()),
            }
        } else {
            let device = &self.device;
            let shaders = &self.shaders;
            let vertex_layout = &record.vertex_layout;
            let render_state = &record.render_state;
            let result = self.pipeline_cache.acquire(key, || {
                Self::create_pipeline(device, shaders, &key, vertex_layout, render_state)
            });
            match result {
                Ok(pipeline) => {
                    record.pipelines.push(key);
                    pipeline
                }
                Err(e) => {
                    // Degraded draw: skip rather than unwind mid-frame.
                    debug_assert!(false, "pipeline creation failed: {e}");
                    log::warn!("pipeline creation failed, skipping draw: {e}");
                    return Ok(());
                }
            }
        };

        let (bind0, bind1) = match record.bind_groups.get(&key) {
            Some(groups) => groups.clone(),
            None => {
                let mut entries: Vec<wgpu::BindGroupEntry> = Vec::new();
                for slot in &record.uniforms {
                    if slot.group != 0 {
                        log::warn!("uniform buffer in group {} unsupported, expected 0", slot.group);
                        continue;
                    }
                    entries.push(wgpu::BindGroupEntry {
                        binding: slot.binding,
                        resource: slot.buffer.as_entire_binding(),
                    });
                }
                let bind0 = Arc::new(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: None,
                    layout: &pipeline.get_bind_group_layout(0),
                    entries: &entries,
                }));

                let needs_textures = record.shader_ids.iter().any(|id| {
                    self.shaders
                        .get(id)
                        .is_some_and(|s| !s.layout.sampled_textures.is_empty())
                });
                let bind1 = if needs_textures && !record.texture_ids.is_empty() {
                    let mut entries: Vec<wgpu::BindGroupEntry> = Vec::new();
                    let mut samplers = Vec::new();
                    for key in &record.sampler_keys {
                        match self.sampler_cache.get(*key) {
                            Some(sampler) => samplers.push(sampler),
                            None => return Ok(()),
                        }
                    }
                    for (slot, (texture_id, sampler)) in
                        record.texture_ids.iter().zip(&samplers).enumerate()
                    {
                        let Some(texture) = self.textures.get(texture_id) else {
                            log::warn!("draw references missing texture, skipping");
                            return Ok(());
                        };
                        entries.push(wgpu::BindGroupEntry {
                            binding: (slot * 2) as u32,
                            resource: wgpu::BindingResource::TextureView(&texture.view),
                        });
                        entries.push(wgpu::BindGroupEntry {
                            binding: (slot * 2 + 1) as u32,
                            resource: wgpu::BindingResource::Sampler(sampler),
                        });
                    }
                    Some(Arc::new(self.device.create_bind_group(
                        &wgpu::BindGroupDescriptor {
                            label: None,
                            layout: &pipeline.get_bind_group_layout(1),
                            entries: &entries,
                        },
                    )))
                } else {
                    None
                };
                record
                    .bind_groups
                    .insert(key, (bind0.clone(), bind1.clone()));
                (bind0, bind1)
            }
        };

        let draw = DrawCmd {
            pipeline,
            bind0,
            bind1,
            vertex_buffer: record.vertex_buffer,
            index_buffer: record.index_buffer,
            draw_count: record.draw_count,
        };
        if let Some(group) = self.passes.last_mut() {
            group.draws.push(draw);
        } else {
            log::warn!("draw outside an active frame, dropped");
        }
        self.draw_calls += 1;
        Ok(())
    }

    fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            rasterizer_states: 0,
            blend_states: 0,
            depth_stencil_states: 0,
            input_layouts: 0,
            samplers: self.sampler_cache.len(),
            pipelines: self.pipeline_cache.len(),
            buffer_uploads: self.buffer_uploads,
            uniform_uploads: self.uniform_uploads,
            draw_calls: self.draw_calls,
            error_shader_substitutions: self.error_shader_substitutions,
        }
    }
}
