//! Vulkan backend built on ash.
//!
//! Explicit frame pipelining: `frames_in_flight` slots, each with its own
//! command buffer, fence and semaphore pair. `begin_frame` waits on the
//! slot's fence with the configured timeout; a timeout marks the device
//! lost rather than blocking forever. Uniform buffers are duplicated per
//! slot so the CPU never writes memory a previous frame still reads.
//!
//! Shaders are WGSL, cross-compiled to SPIR-V through naga at bind time.
//! Fixed-function state has no standalone native objects in Vulkan, so the
//! packed state keys combine into one pipeline key deduplicated through the
//! refcounted cache; samplers are cached individually.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::sync::Arc;

use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

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
    AddressMode, BlendFactor, BlendOperation, BufferUsage, ColorWrites, CompareFunction,
    CullMode, FilterMode, FrontFace, RenderState, SamplerDescriptor, ScissorRect,
    StencilOperation, TextureFormat, Viewport,
};

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

fn convert_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

fn convert_format_back(format: vk::Format) -> TextureFormat {
    match format {
        vk::Format::R8G8B8A8_SRGB => TextureFormat::Rgba8UnormSrgb,
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8Unorm,
        _ => TextureFormat::Rgba8Unorm,
    }
}

fn convert_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

fn convert_front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Cw => vk::FrontFace::CLOCKWISE,
    }
}

fn convert_compare_op(func: CompareFunction) -> vk::CompareOp {
    match func {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

fn convert_blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::Src => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrc => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::Dst => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDst => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

fn convert_blend_op(op: BlendOperation) -> vk::BlendOp {
    match op {
        BlendOperation::Add => vk::BlendOp::ADD,
        BlendOperation::Subtract => vk::BlendOp::SUBTRACT,
        BlendOperation::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOperation::Min => vk::BlendOp::MIN,
        BlendOperation::Max => vk::BlendOp::MAX,
    }
}

fn convert_stencil_op(op: StencilOperation) -> vk::StencilOp {
    match op {
        StencilOperation::Keep => vk::StencilOp::KEEP,
        StencilOperation::Zero => vk::StencilOp::ZERO,
        StencilOperation::Replace => vk::StencilOp::REPLACE,
        StencilOperation::Invert => vk::StencilOp::INVERT,
        StencilOperation::IncrementClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOperation::DecrementClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOperation::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOperation::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

fn convert_color_writes(mask: ColorWrites) -> vk::ColorComponentFlags {
    let mut out = vk::ColorComponentFlags::empty();
    if mask.contains(ColorWrites::RED) {
        out |= vk::ColorComponentFlags::R;
    }
    if mask.contains(ColorWrites::GREEN) {
        out |= vk::ColorComponentFlags::G;
    }
    if mask.contains(ColorWrites::BLUE) {
        out |= vk::ColorComponentFlags::B;
    }
    if mask.contains(ColorWrites::ALPHA) {
        out |= vk::ColorComponentFlags::A;
    }
    out
}

fn convert_filter(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

fn convert_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

fn convert_vertex_format(format: VertexAttributeFormat) -> vk::Format {
    match format {
        VertexAttributeFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexAttributeFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexAttributeFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexAttributeFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexAttributeFormat::Unorm8 => vk::Format::R8_UNORM,
        VertexAttributeFormat::Unorm8x2 => vk::Format::R8G8_UNORM,
        VertexAttributeFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
    }
}

/// Cross-compiles validated WGSL to SPIR-V for one entry point.
fn compile_spirv(
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
    stage: ShaderStage,
    entry_point: &str,
) -> RhiResult<Vec<u32>> {
    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };
    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory:
            naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };
    naga::back::spv::write_vec(module, info, &options, Some(&pipeline_options))
        .map_err(|e| RhiError::ShaderCompilationFailed(format!("SPIR-V generation: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    rasterizer: RasterizerKey,
    blend: BlendKey,
    depth_stencil: DepthStencilKey,
    input_layout: InputLayoutKey,
    vs: ResourceId,
    fs: ResourceId,
    color_format: TextureFormat,
    has_depth: bool,
}

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    in_flight: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
    format: vk::Format,
    refcount: u32,
}

struct VkShader {
    module: vk::ShaderModule,
    entry_point: CString,
    valid: bool,
    layout: ReflectedLayout,
    refcount: u32,
}

struct VkTarget {
    refcount: u32,
    color: Vec<ResourceId>,
    depth: Option<ResourceId>,
    pass_clear: vk::RenderPass,
    pass_load: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    color_format: TextureFormat,
    has_depth: bool,
}

/// A uniform buffer duplicated once per frame slot.
struct UniformSlotBuffers {
    group: u32,
    binding: u32,
    per_slot: Vec<VkBuffer>,
}

struct VkRenderable {
    vertex_buffer: ResourceId,
    index_buffer: Option<(ResourceId, vk::IndexType)>,
    draw_count: u32,
    vertex_layout: VertexLayout,
    render_state: RenderState,
    shader_ids: [ResourceId; 2],
    texture_ids: Vec<ResourceId>,
    sampler_keys: Vec<SamplerKey>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layout: vk::PipelineLayout,
    uniforms: Vec<UniformSlotBuffers>,
    /// Set 0 per frame slot (uniform buffers differ per slot).
    uniform_sets: Vec<vk::DescriptorSet>,
    /// Set 1, shared across slots (textures never change per frame).
    texture_set: Option<vk::DescriptorSet>,
    binder: ParameterBinder,
    pipelines: Vec<PipelineKey>,
}

pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    allocator: Option<Arc<Mutex<Allocator>>>,

    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_framebuffers: Vec<vk::Framebuffer>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    current_image_index: u32,
    depth_image: Option<VkTexture>,
    surface_pass_clear: vk::RenderPass,
    surface_pass_load: vk::RenderPass,

    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    slots: Vec<FrameSlot>,
    frames_in_flight: usize,
    frame_index: u64,
    frame_active: bool,
    current_slot: usize,
    /// Target of the currently open render pass, `None` for the surface.
    pass_target: Option<Option<ResourceId>>,
    active_render_pass: vk::RenderPass,
    cleared: HashSet<Option<ResourceId>>,
    device_lost: bool,
    fence_timeout_ns: u64,
    vsync: bool,
    clear_color: [f32; 4],

    buffers: HashMap<ResourceId, VkBuffer>,
    textures: HashMap<ResourceId, VkTexture>,
    shaders: HashMap<ResourceId, VkShader>,
    targets: HashMap<ResourceId, VkTarget>,
    renderables: HashMap<ResourceId, VkRenderable>,
    pipeline_cache: StateCache<PipelineKey, vk::Pipeline>,
    sampler_cache: StateCache<SamplerKey, vk::Sampler>,

    buffer_uploads: u64,
    uniform_uploads: u64,
    draw_calls: u64,
    error_shader_substitutions: u64,
}

impl VulkanBackend {
    pub fn new(config: &RhiConfig, surface_target: SurfaceTarget) -> RhiResult<Self> {
        let SurfaceTarget::Window(window) = surface_target else {
            return Err(RhiError::InitializationFailed(
                "vulkan backend requires a window surface".to_string(),
            ));
        };
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo {
                p_application_name: c"rhi".as_ptr(),
                application_version: vk::make_api_version(0, 1, 0, 0),
                p_engine_name: c"rhi".as_ptr(),
                engine_version: vk::make_api_version(0, 1, 0, 0),
                api_version: vk::API_VERSION_1_2,
                ..Default::default()
            };

            let display_handle = window
                .display_handle()
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo {
                p_application_info: &app_info,
                enabled_extension_count: extensions.len() as u32,
                pp_enabled_extension_names: extensions.as_ptr(),
                ..Default::default()
            };
            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let vk_surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| RhiError::SurfaceCreationFailed(e.to_string()))?;

            let physical_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;
            let physical_device = physical_devices
                .into_iter()
                .find(|&pd| Self::find_queue_family(&instance, pd, &surface_fn, vk_surface).is_some())
                .ok_or_else(|| {
                    RhiError::InitializationFailed("no suitable physical device".to_string())
                })?;
            let graphics_queue_family =
                Self::find_queue_family(&instance, physical_device, &surface_fn, vk_surface)
                    .ok_or_else(|| {
                        RhiError::InitializationFailed("no suitable queue family".to_string())
                    })?;

            let device_name = instance
                .get_physical_device_properties(physical_device)
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            log::info!("vulkan adapter: {device_name}");

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo {
                queue_family_index: graphics_queue_family,
                queue_count: 1,
                p_queue_priorities: queue_priorities.as_ptr(),
                ..Default::default()
            };
            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default();
            let device_info = vk::DeviceCreateInfo {
                queue_create_info_count: 1,
                p_queue_create_infos: &queue_info,
                enabled_extension_count: device_extensions.len() as u32,
                pp_enabled_extension_names: device_extensions.as_ptr(),
                p_enabled_features: &device_features,
                ..Default::default()
            };
            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| RhiError::DeviceCreationFailed(e.to_string()))?;
            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo {
                queue_family_index: graphics_queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;

            let frames_in_flight = config.frames_in_flight_clamped() as usize;
            let alloc_info = vk::CommandBufferAllocateInfo {
                command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: frames_in_flight as u32,
                ..Default::default()
            };
            let command_buffers = device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            // Signaled so the first frame of each slot does not block.
            let fence_info = vk::FenceCreateInfo {
                flags: vk::FenceCreateFlags::SIGNALED,
                ..Default::default()
            };
            let mut slots = Vec::with_capacity(frames_in_flight);
            for command_buffer in command_buffers {
                slots.push(FrameSlot {
                    command_buffer,
                    in_flight: device
                        .create_fence(&fence_info, None)
                        .map_err(|e| RhiError::InitializationFailed(e.to_string()))?,
                    image_available: device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(|e| RhiError::InitializationFailed(e.to_string()))?,
                    render_finished: device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(|e| RhiError::InitializationFailed(e.to_string()))?,
                });
            }

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 1000,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: 1000,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: 1000,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo {
                pool_size_count: pool_sizes.len() as u32,
                p_pool_sizes: pool_sizes.as_ptr(),
                max_sets: 1000,
                flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
                ..Default::default()
            };
            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface: vk_surface,
                physical_device,
                device,
                graphics_queue,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_framebuffers: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_UNORM,
                swapchain_extent: vk::Extent2D {
                    width: 0,
                    height: 0,
                },
                current_image_index: 0,
                depth_image: None,
                surface_pass_clear: vk::RenderPass::null(),
                surface_pass_load: vk::RenderPass::null(),
                command_pool,
                descriptor_pool,
                slots,
                frames_in_flight,
                frame_index: 0,
                frame_active: false,
                current_slot: 0,
                pass_target: None,
                active_render_pass: vk::RenderPass::null(),
                cleared: HashSet::new(),
                device_lost: false,
                fence_timeout_ns: config.fence_timeout.as_nanos().min(u64::MAX as u128) as u64,
                vsync: config.vsync,
                clear_color: config.clear_color,
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
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;
            Ok(backend)
        }
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        vk_surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        for (index, family) in queue_families.iter().enumerate() {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(
                        physical_device,
                        index as u32,
                        vk_surface,
                    )
                    .unwrap_or(false)
            };
            if supports_graphics && supports_surface {
                return Some(index as u32);
            }
        }
        None
    }

    /// Builds a color(+depth) render pass pair: one variant clearing on
    /// load for each attachment's first use in a frame, one loading.
    fn create_pass_pair(
        device: &ash::Device,
        color_format: vk::Format,
        has_depth: bool,
        final_layout: vk::ImageLayout,
    ) -> RhiResult<(vk::RenderPass, vk::RenderPass)> {
        let build = |clear: bool| -> RhiResult<vk::RenderPass> {
            let color = vk::AttachmentDescription {
                format: color_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: if clear {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                },
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: if clear {
                    vk::ImageLayout::UNDEFINED
                } else {
                    final_layout
                },
                final_layout,
                ..Default::default()
            };
            let depth = vk::AttachmentDescription {
                format: DEPTH_FORMAT,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: if clear {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                },
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: if clear {
                    vk::ImageLayout::UNDEFINED
                } else {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                },
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            };
            let attachments = if has_depth {
                vec![color, depth]
            } else {
                vec![color]
            };
            let color_ref = vk::AttachmentReference {
                attachment: 0,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            };
            let depth_ref = vk::AttachmentReference {
                attachment: 1,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            };
            let subpass = vk::SubpassDescription {
                pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
                color_attachment_count: 1,
                p_color_attachments: &color_ref,
                p_depth_stencil_attachment: if has_depth {
                    &depth_ref
                } else {
                    std::ptr::null()
                },
                ..Default::default()
            };
            let dependency = vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ..Default::default()
            };
            let info = vk::RenderPassCreateInfo {
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                subpass_count: 1,
                p_subpasses: &subpass,
                dependency_count: 1,
                p_dependencies: &dependency,
                ..Default::default()
            };
            unsafe { device.create_render_pass(&info, None) }
                .map_err(|e| RhiError::InitializationFailed(e.to_string()))
        };
        Ok((build(true)?, build(false)?))
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> RhiResult<()> {
        unsafe {
            let _ = self.device.device_wait_idle();

            for &framebuffer in &self.swapchain_framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.swapchain_framebuffers.clear();
            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_image_views.clear();
            if let Some(depth) = self.depth_image.take() {
                self.destroy_vk_texture(depth);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            }

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| RhiError::SwapchainCreationFailed(e.to_string()))?;
            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| RhiError::SwapchainCreationFailed(e.to_string()))?;
            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(|e| RhiError::SwapchainCreationFailed(e.to_string()))?;
            if formats.is_empty() {
                return Err(RhiError::SwapchainCreationFailed(
                    "no surface formats".to_string(),
                ));
            }

            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_UNORM
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .unwrap_or(&formats[0]);

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let swapchain_info = vk::SwapchainCreateInfoKHR {
                surface: self.surface,
                min_image_count: image_count,
                image_format: format.format,
                image_color_space: format.color_space,
                image_extent: extent,
                image_array_layers: 1,
                image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                image_sharing_mode: vk::SharingMode::EXCLUSIVE,
                pre_transform: capabilities.current_transform,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                present_mode,
                clipped: vk::TRUE,
                ..Default::default()
            };
            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| RhiError::SwapchainCreationFailed(e.to_string()))?;
            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| RhiError::SwapchainCreationFailed(e.to_string()))?;

            if self.swapchain_format != format.format
                || self.surface_pass_clear == vk::RenderPass::null()
            {
                if self.surface_pass_clear != vk::RenderPass::null() {
                    self.device.destroy_render_pass(self.surface_pass_clear, None);
                    self.device.destroy_render_pass(self.surface_pass_load, None);
                }
                let (pass_clear, pass_load) = Self::create_pass_pair(
                    &self.device,
                    format.format,
                    true,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                )?;
                self.surface_pass_clear = pass_clear;
                self.surface_pass_load = pass_load;
            }
            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            self.swapchain_image_views = self
                .swapchain_images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo {
                        image,
                        view_type: vk::ImageViewType::TYPE_2D,
                        format: format.format,
                        components: vk::ComponentMapping::default(),
                        subresource_range: vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        ..Default::default()
                    };
                    self.device.create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| RhiError::SwapchainCreationFailed(e.to_string()))?;

            let depth = self.create_image(
                extent.width,
                extent.height,
                DEPTH_FORMAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::ImageAspectFlags::DEPTH,
            )?;
            self.depth_image = Some(depth);
            let depth_view = self
                .depth_image
                .as_ref()
                .map(|d| d.view)
                .unwrap_or(vk::ImageView::null());

            self.swapchain_framebuffers = self
                .swapchain_image_views
                .iter()
                .map(|&view| {
                    let attachments = [view, depth_view];
                    let info = vk::FramebufferCreateInfo {
                        render_pass: self.surface_pass_clear,
                        attachment_count: attachments.len() as u32,
                        p_attachments: attachments.as_ptr(),
                        width: extent.width,
                        height: extent.height,
                        layers: 1,
                        ..Default::default()
                    };
                    self.device.create_framebuffer(&info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| RhiError::SwapchainCreationFailed(e.to_string()))?;

            Ok(())
        }
    }

    fn allocator_ref(&self) -> RhiResult<&Arc<Mutex<Allocator>>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| RhiError::Internal("allocator already dropped".to_string()))
    }

    fn create_cpu_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> RhiResult<VkBuffer> {
        let buffer_info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| RhiError::BufferCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self
            .allocator_ref()?
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RhiError::BufferCreationFailed(e.to_string()))?;
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .map_err(|e| RhiError::BufferCreationFailed(e.to_string()))?;
        Ok(VkBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    fn write_vk_buffer(vk_buffer: &mut VkBuffer, data: &[u8]) {
        if let Some(allocation) = vk_buffer.allocation.as_mut() {
            if let Some(mapped) = allocation.mapped_slice_mut() {
                let len = data.len().min(mapped.len());
                mapped[..len].copy_from_slice(&data[..len]);
            }
        }
    }

    fn destroy_vk_buffer(&mut self, mut vk_buffer: VkBuffer) {
        unsafe {
            self.device.destroy_buffer(vk_buffer.buffer, None);
        }
        if let (Some(allocation), Some(allocator)) =
            (vk_buffer.allocation.take(), self.allocator.as_ref())
        {
            let _ = allocator.lock().free(allocation);
        }
    }

    fn create_image(
        &mut self,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<VkTexture> {
        let image_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            initial_layout: vk::ImageLayout::UNDEFINED,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| RhiError::TextureCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self
            .allocator_ref()?
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "texture",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RhiError::TextureCreationFailed(e.to_string()))?;
        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(|e| RhiError::TextureCreationFailed(e.to_string()))?;

        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| RhiError::TextureCreationFailed(e.to_string()))?;

        Ok(VkTexture {
            image,
            allocation: Some(allocation),
            view,
            format,
            refcount: 1,
        })
    }

    fn destroy_vk_texture(&mut self, mut texture: VkTexture) {
        unsafe {
            self.device.destroy_image_view(texture.view, None);
            self.device.destroy_image(texture.image, None);
        }
        if let (Some(allocation), Some(allocator)) =
            (texture.allocation.take(), self.allocator.as_ref())
        {
            let _ = allocator.lock().free(allocation);
        }
    }

    fn begin_single_time_commands(&self) -> RhiResult<vk::CommandBuffer> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo {
                command_pool: self.command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| RhiError::Internal(e.to_string()))?[0];
            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| RhiError::Internal(e.to_string()))?;
            Ok(cmd)
        }
    }

    fn end_single_time_commands(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| RhiError::Internal(e.to_string()))?;
            let submit_info = vk::SubmitInfo {
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                .map_err(|e| RhiError::Internal(e.to_string()))?;
            self.device
                .queue_wait_idle(self.graphics_queue)
                .map_err(|e| RhiError::Internal(e.to_string()))?;
            self.device.free_command_buffers(self.command_pool, &[cmd]);
            Ok(())
        }
    }

    /// Staged upload with layout transitions to SHADER_READ_ONLY.
    fn upload_texture_pixels(&mut self, texture: &VkTexture, pixels: &[u8], width: u32, height: u32) -> RhiResult<()> {
        let mut staging = self.create_cpu_buffer(
            pixels.len().max(4) as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        Self::write_vk_buffer(&mut staging, pixels);

        let cmd = self.begin_single_time_commands()?;
        unsafe {
            let subresource = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            let to_transfer = vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: texture.image,
                subresource_range: subresource,
                ..Default::default()
            };
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            let to_sampled = vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: texture.image,
                subresource_range: subresource,
                ..Default::default()
            };
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_sampled],
            );
        }
        self.end_single_time_commands(cmd)?;
        self.destroy_vk_buffer(staging);
        self.buffer_uploads += 1;
        Ok(())
    }

    fn retain_shader(&mut self, shader: &Shader) -> RhiResult<()> {
        if let Some(record) = self.shaders.get_mut(&shader.id()) {
            record.refcount += 1;
            return Ok(());
        }
        let (valid, compiled) = match compile_shader(shader) {
            Ok(module) => (true, module),
            Err(e) => {
                log::warn!(
                    "shader '{}' failed to compile, using error shader: {e}",
                    shader.name()
                );
                self.error_shader_substitutions += 1;
                let fallback = Shader::new(shader.name(), shader.stage(), ERROR_SHADER_SOURCE);
                (false, compile_shader(&fallback)?)
            }
        };
        let spv = compile_spirv(
            &compiled.module,
            &compiled.info,
            compiled.stage,
            &compiled.entry_point,
        )?;
        let create_info = vk::ShaderModuleCreateInfo {
            code_size: spv.len() * 4,
            p_code: spv.as_ptr(),
            ..Default::default()
        };
        let module = unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| RhiError::ShaderCompilationFailed(e.to_string()))?;
        let entry_point = CString::new(compiled.entry_point.as_str())
            .map_err(|e| RhiError::ShaderCompilationFailed(e.to_string()))?;
        self.shaders.insert(
            shader.id(),
            VkShader {
                module,
                entry_point,
                valid,
                layout: compiled.layout,
                refcount: 1,
            },
        );
        Ok(())
    }

    fn release_shader(&mut self, id: ResourceId) {
        match self.shaders.get_mut(&id) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                if let Some(record) = self.shaders.remove(&id) {
                    unsafe {
                        self.device.destroy_shader_module(record.module, None);
                    }
                }
            }
            None => log::warn!("release of unbound shader {id:?}"),
        }
    }

    fn retain_texture(&mut self, texture: &Texture) -> RhiResult<()> {
        if let Some(record) = self.textures.get_mut(&texture.id()) {
            record.refcount += 1;
            return Ok(());
        }
        let is_depth = texture.format().is_depth();
        let format = convert_format(texture.format());
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if texture.pixels().is_none() {
            usage |= if is_depth {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            };
        }
        let aspect = if is_depth {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let record = self.create_image(texture.width(), texture.height(), format, usage, aspect)?;
        if let Some(pixels) = texture.pixels() {
            self.upload_texture_pixels(&record, pixels, texture.width(), texture.height())?;
        }
        self.textures.insert(texture.id(), record);
        Ok(())
    }

    fn release_texture(&mut self, id: ResourceId) {
        match self.textures.get_mut(&id) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                if let Some(record) = self.textures.remove(&id) {
                    self.destroy_vk_texture(record);
                }
            }
            None => log::warn!("release of unbound texture {id:?}"),
        }
    }

    fn create_vk_sampler(device: &ash::Device, desc: &SamplerDescriptor) -> RhiResult<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: convert_filter(desc.mag_filter),
            min_filter: convert_filter(desc.min_filter),
            mipmap_mode: match desc.mip_filter {
                FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
                FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
            },
            address_mode_u: convert_address_mode(desc.address_u),
            address_mode_v: convert_address_mode(desc.address_v),
            address_mode_w: convert_address_mode(desc.address_w),
            compare_enable: if desc.compare.is_some() {
                vk::TRUE
            } else {
                vk::FALSE
            },
            compare_op: desc
                .compare
                .map(convert_compare_op)
                .unwrap_or(vk::CompareOp::ALWAYS),
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
            ..Default::default()
        };
        unsafe { device.create_sampler(&sampler_info, None) }
            .map_err(|e| RhiError::TextureCreationFailed(e.to_string()))
    }

    fn create_pipeline(
        device: &ash::Device,
        shaders: &HashMap<ResourceId, VkShader>,
        key: &PipelineKey,
        vertex_layout: &VertexLayout,
        state: &RenderState,
        pipeline_layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> RhiResult<vk::Pipeline> {
        let vs = shaders.get(&key.vs).ok_or_else(|| {
            RhiError::PipelineCreationFailed("vertex shader not bound".to_string())
        })?;
        let fs = shaders.get(&key.fs).ok_or_else(|| {
            RhiError::PipelineCreationFailed("fragment shader not bound".to_string())
        })?;

        let stages = [
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::VERTEX,
                module: vs.module,
                p_name: vs.entry_point.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fs.module,
                p_name: fs.entry_point.as_ptr(),
                ..Default::default()
            },
        ];

        let binding = vk::VertexInputBindingDescription {
            binding: 0,
            stride: vertex_layout.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        };
        let attributes: Vec<vk::VertexInputAttributeDescription> = vertex_layout
            .attributes()
            .iter()
            .enumerate()
            .map(|(i, attribute)| vk::VertexInputAttributeDescription {
                location: i as u32,
                binding: 0,
                format: convert_vertex_format(attribute.format),
                offset: vertex_layout.offset_of(i),
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: 1,
            p_vertex_binding_descriptions: &binding,
            vertex_attribute_description_count: attributes.len() as u32,
            p_vertex_attribute_descriptions: attributes.as_ptr(),
            ..Default::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart_enable: vk::FALSE,
            ..Default::default()
        };

        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let rasterization = vk::PipelineRasterizationStateCreateInfo {
            depth_clamp_enable: vk::FALSE,
            rasterizer_discard_enable: vk::FALSE,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: convert_cull_mode(state.cull_mode),
            front_face: convert_front_face(state.front_face),
            depth_bias_enable: vk::FALSE,
            line_width: 1.0,
            ..Default::default()
        };

        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };

        let stencil_state = match &state.stencil {
            Some(stencil) => vk::StencilOpState {
                fail_op: convert_stencil_op(stencil.fail_op),
                pass_op: convert_stencil_op(stencil.pass_op),
                depth_fail_op: convert_stencil_op(stencil.depth_fail_op),
                compare_op: convert_compare_op(stencil.compare),
                compare_mask: stencil.read_mask as u32,
                write_mask: stencil.write_mask as u32,
                reference: 0,
            },
            None => vk::StencilOpState::default(),
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            depth_test_enable: if key.has_depth { vk::TRUE } else { vk::FALSE },
            depth_write_enable: if state.depth_write { vk::TRUE } else { vk::FALSE },
            depth_compare_op: convert_compare_op(state.depth_compare),
            stencil_test_enable: if state.stencil.is_some() {
                vk::TRUE
            } else {
                vk::FALSE
            },
            front: stencil_state,
            back: stencil_state,
            ..Default::default()
        };

        let blend_attachment = match &state.blend {
            Some(blend) => vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::TRUE,
                src_color_blend_factor: convert_blend_factor(blend.color.src_factor),
                dst_color_blend_factor: convert_blend_factor(blend.color.dst_factor),
                color_blend_op: convert_blend_op(blend.color.operation),
                src_alpha_blend_factor: convert_blend_factor(blend.alpha.src_factor),
                dst_alpha_blend_factor: convert_blend_factor(blend.alpha.dst_factor),
                alpha_blend_op: convert_blend_op(blend.alpha.operation),
                color_write_mask: convert_color_writes(state.color_write_mask),
            },
            None => vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::FALSE,
                color_write_mask: convert_color_writes(state.color_write_mask),
                ..Default::default()
            },
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            attachment_count: 1,
            p_attachments: &blend_attachment,
            ..Default::default()
        };

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &rasterization,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic,
            layout: pipeline_layout,
            render_pass,
            subpass: 0,
            ..Default::default()
        };

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| RhiError::PipelineCreationFailed(e.to_string()))?;
        pipelines
            .first()
            .copied()
            .ok_or_else(|| RhiError::PipelineCreationFailed("no pipeline returned".to_string()))
    }

    fn end_active_pass(&mut self) {
        if self.pass_target.is_some() {
            unsafe {
                self.device
                    .cmd_end_render_pass(self.slots[self.current_slot].command_buffer);
            }
            self.pass_target = None;
        }
    }

    fn begin_pass(&mut self, target: Option<ResourceId>, viewport: Viewport) {
        self.end_active_pass();
        let first_use = self.cleared.insert(target);

        let (render_pass, framebuffer, extent) = match target {
            Some(target_id) => match self.targets.get(&target_id) {
                Some(record) => (
                    if first_use {
                        record.pass_clear
                    } else {
                        record.pass_load
                    },
                    record.framebuffer,
                    record.extent,
                ),
                None => {
                    log::warn!("view targets unbound render target, ignored");
                    return;
                }
            },
            None => (
                if first_use {
                    self.surface_pass_clear
                } else {
                    self.surface_pass_load
                },
                self.swapchain_framebuffers[self.current_image_index as usize],
                self.swapchain_extent,
            ),
        };

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo {
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
            clear_value_count: clear_values.len() as u32,
            p_clear_values: clear_values.as_ptr(),
            ..Default::default()
        };
        let cmd = self.slots[self.current_slot].command_buffer;
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            self.device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                }],
            );
            self.device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                }],
            );
        }
        self.pass_target = Some(target);
        self.active_render_pass = render_pass;
    }
}

impl RenderBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        debug_assert!(!self.frame_active);
        if width > 0 && height > 0 {
            self.create_swapchain(width, height)?;
        }
        Ok(())
    }

    fn begin_frame(&mut self) -> RhiResult<FrameContext> {
        if self.device_lost {
            return Err(RhiError::DeviceLost);
        }
        let slot_index = (self.frame_index % self.frames_in_flight as u64) as usize;
        let slot = &self.slots[slot_index];
        unsafe {
            match self
                .device
                .wait_for_fences(&[slot.in_flight], true, self.fence_timeout_ns)
            {
                Ok(()) => {}
                Err(vk::Result::TIMEOUT) => {
                    log::error!("frame fence wait timed out, marking device lost");
                    self.device_lost = true;
                    return Err(RhiError::DeviceLost);
                }
                Err(e) => {
                    self.device_lost = true;
                    return Err(RhiError::Internal(e.to_string()));
                }
            }

            let acquire = self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                slot.image_available,
                vk::Fence::null(),
            );
            let (image_index, _) = match acquire {
                Ok(result) => result,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    let extent = self.swapchain_extent;
                    self.create_swapchain(extent.width, extent.height)?;
                    let slot = &self.slots[slot_index];
                    self.swapchain_fn
                        .acquire_next_image(
                            self.swapchain,
                            u64::MAX,
                            slot.image_available,
                            vk::Fence::null(),
                        )
                        .map_err(|e| RhiError::AcquireImageFailed(e.to_string()))?
                }
                Err(vk::Result::ERROR_DEVICE_LOST) => {
                    self.device_lost = true;
                    return Err(RhiError::DeviceLost);
                }
                Err(e) => return Err(RhiError::AcquireImageFailed(e.to_string())),
            };
            self.current_image_index = image_index;

            let slot = &self.slots[slot_index];
            self.device
                .reset_fences(&[slot.in_flight])
                .map_err(|e| RhiError::Internal(e.to_string()))?;
            self.device
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RhiError::Internal(e.to_string()))?;
            let begin_info = vk::CommandBufferBeginInfo::default();
            self.device
                .begin_command_buffer(slot.command_buffer, &begin_info)
                .map_err(|e| RhiError::Internal(e.to_string()))?;
        }

        self.current_slot = slot_index;
        self.frame_active = true;
        self.cleared.clear();
        let viewport = Viewport::from_extent(self.swapchain_extent.width, self.swapchain_extent.height);
        self.begin_pass(None, viewport);

        Ok(FrameContext {
            frame_index: self.frame_index,
            slot: slot_index,
            width: self.swapchain_extent.width,
            height: self.swapchain_extent.height,
        })
    }

    fn end_frame(&mut self) -> RhiResult<()> {
        if !self.frame_active {
            return Err(RhiError::FrameNotActive);
        }
        // The pass over the surface must run even if nothing was drawn so
        // the image reaches PRESENT_SRC.
        if self.pass_target != Some(None) {
            let viewport =
                Viewport::from_extent(self.swapchain_extent.width, self.swapchain_extent.height);
            self.begin_pass(None, viewport);
        }
        self.end_active_pass();
        self.frame_active = false;

        let slot = &self.slots[self.current_slot];
        unsafe {
            self.device
                .end_command_buffer(slot.command_buffer)
                .map_err(|e| RhiError::PresentFailed(e.to_string()))?;

            let wait_semaphores = [slot.image_available];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [slot.render_finished];
            let command_buffers = [slot.command_buffer];
            let submit_info = vk::SubmitInfo {
                wait_semaphore_count: 1,
                p_wait_semaphores: wait_semaphores.as_ptr(),
                p_wait_dst_stage_mask: wait_stages.as_ptr(),
                command_buffer_count: 1,
                p_command_buffers: command_buffers.as_ptr(),
                signal_semaphore_count: 1,
                p_signal_semaphores: signal_semaphores.as_ptr(),
                ..Default::default()
            };
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], slot.in_flight)
                .map_err(|e| RhiError::PresentFailed(e.to_string()))?;

            let swapchains = [self.swapchain];
            let image_indices = [self.current_image_index];
            let present_info = vk::PresentInfoKHR {
                wait_semaphore_count: 1,
                p_wait_semaphores: signal_semaphores.as_ptr(),
                swapchain_count: 1,
                p_swapchains: swapchains.as_ptr(),
                p_image_indices: image_indices.as_ptr(),
                ..Default::default()
            };
            match self
                .swapchain_fn
                .queue_present(self.graphics_queue, &present_info)
            {
                Ok(_) => {}
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                    let extent = self.swapchain_extent;
                    self.create_swapchain(extent.width, extent.height)?;
                }
                Err(vk::Result::ERROR_DEVICE_LOST) => {
                    self.device_lost = true;
                    return Err(RhiError::DeviceLost);
                }
                Err(e) => return Err(RhiError::PresentFailed(e.to_string())),
            }
        }
        self.frame_index += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| RhiError::Internal(e.to_string()))
    }

    fn set_view(&mut self, view: Option<&View>) -> RhiResult<()> {
        match view {
            Some(view) => {
                if let Some(target) = view.target() {
                    if !self.targets.contains_key(&target.id()) {
                        self.bind_render_target(target)?;
                    }
                }
                self.begin_pass(view.target().map(|t| t.id()), view.viewport());
            }
            None => {
                let viewport = Viewport::from_extent(
                    self.swapchain_extent.width,
                    self.swapchain_extent.height,
                );
                self.begin_pass(None, viewport);
            }
        }
        Ok(())
    }

    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        if self.pass_target.is_none() {
            return;
        }
        let rect = match scissor {
            Some(scissor) => vk::Rect2D {
                offset: vk::Offset2D {
                    x: scissor.x as i32,
                    y: scissor.y as i32,
                },
                extent: vk::Extent2D {
                    width: scissor.width,
                    height: scissor.height,
                },
            },
            None => vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.swapchain_extent,
            },
        };
        unsafe {
            self.device
                .cmd_set_scissor(self.slots[self.current_slot].command_buffer, 0, &[rect]);
        }
    }

    fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    fn bind_shader(&mut self, shader: &Shader) -> RhiResult<()> {
        self.retain_shader(shader)
    }

    fn unbind_shader(&mut self, shader: &Shader) -> RhiResult<()> {
        self.release_shader(shader.id());
        Ok(())
    }

    fn is_shader_valid(&self, shader: &Shader) -> bool {
        self.shaders.get(&shader.id()).is_some_and(|r| r.valid)
    }

    fn bind_texture(&mut self, texture: &Texture) -> RhiResult<()> {
        self.retain_texture(texture)
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
            self.retain_texture(texture)?;
            color.push(texture.id());
        }
        let depth = match target.depth_attachment() {
            Some(texture) => {
                self.retain_texture(texture)?;
                Some(texture.id())
            }
            None => None,
        };
        let color_format = target
            .color_attachments()
            .first()
            .map(|t| t.format())
            .unwrap_or(TextureFormat::Rgba8Unorm);
        let has_depth = depth.is_some();

        let (pass_clear, pass_load) = Self::create_pass_pair(
            &self.device,
            convert_format(color_format),
            has_depth,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let mut attachments: Vec<vk::ImageView> = Vec::new();
        for id in color.iter().chain(depth.iter()) {
            match self.textures.get(id) {
                Some(texture) => attachments.push(texture.view),
                None => {
                    return Err(RhiError::TextureCreationFailed(
                        "render target attachment missing".to_string(),
                    ))
                }
            }
        }
        let extent = vk::Extent2D {
            width: target.width(),
            height: target.height(),
        };
        let framebuffer_info = vk::FramebufferCreateInfo {
            render_pass: pass_clear,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) }
            .map_err(|e| RhiError::TextureCreationFailed(e.to_string()))?;

        self.targets.insert(
            target.id(),
            VkTarget {
                refcount: 1,
                color,
                depth,
                pass_clear,
                pass_load,
                framebuffer,
                extent,
                color_format,
                has_depth,
            },
        );
        Ok(())
    }

    fn unbind_render_target(&mut self, target: &RenderTarget) -> RhiResult<()> {
        match self.targets.get_mut(&target.id()) {
            Some(record) if record.refcount > 1 => record.refcount -= 1,
            Some(_) => {
                if let Some(record) = self.targets.remove(&target.id()) {
                    unsafe {
                        self.device.destroy_framebuffer(record.framebuffer, None);
                        self.device.destroy_render_pass(record.pass_clear, None);
                        self.device.destroy_render_pass(record.pass_load, None);
                    }
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

        self.retain_shader(material.vertex_shader())?;
        self.retain_shader(material.fragment_shader())?;
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
            self.retain_texture(&binding.texture)?;
            texture_ids.push(binding.texture.id());
            let key = SamplerKey::pack(&binding.sampler);
            let device = &self.device;
            let desc = binding.sampler;
            self.sampler_cache
                .acquire(key, || Self::create_vk_sampler(device, &desc))?;
            sampler_keys.push(key);
        }

        let mesh = renderable.mesh_mut();
        let vertex_layout = mesh.layout().clone();
        let draw_count = mesh.draw_count();
        let vertex_id = mesh.vertex_buffer().id();
        let vertex_data = mesh.vertex_buffer().data().to_vec();
        let mut vertex = self.create_cpu_buffer(
            vertex_data.len().max(4) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        Self::write_vk_buffer(&mut vertex, &vertex_data);
        self.buffer_uploads += 1;
        self.buffers.insert(vertex_id, vertex);
        mesh.vertex_buffer_mut().mark_clean();

        let index_buffer = match mesh.index_buffer() {
            Some(indices) => {
                let index_type = if indices.stride() == 2 {
                    vk::IndexType::UINT16
                } else {
                    vk::IndexType::UINT32
                };
                let id = indices.id();
                let data = indices.data().to_vec();
                let mut buffer = self.create_cpu_buffer(
                    data.len().max(4) as u64,
                    vk::BufferUsageFlags::INDEX_BUFFER,
                )?;
                Self::write_vk_buffer(&mut buffer, &data);
                self.buffer_uploads += 1;
                self.buffers.insert(id, buffer);
                if let Some(indices) = mesh.index_buffer_mut() {
                    indices.mark_clean();
                }
                Some((id, index_type))
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

        // Set 0: uniform buffers, duplicated per frame slot.
        let mut uniforms = Vec::new();
        let mut set0_bindings = Vec::new();
        for layout in binder.buffer_layouts() {
            let mut per_slot = Vec::with_capacity(self.frames_in_flight);
            for _ in 0..self.frames_in_flight {
                per_slot.push(self.create_cpu_buffer(
                    (layout.size_bytes.max(16)) as u64,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                )?);
            }
            set0_bindings.push(vk::DescriptorSetLayoutBinding {
                binding: layout.binding,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            });
            uniforms.push(UniformSlotBuffers {
                group: layout.group,
                binding: layout.binding,
                per_slot,
            });
        }

        // Set 1: texture at binding 2i, sampler at 2i+1.
        let mut set1_bindings = Vec::new();
        for slot in 0..texture_ids.len() {
            set1_bindings.push(vk::DescriptorSetLayoutBinding {
                binding: (slot * 2) as u32,
                descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            });
            set1_bindings.push(vk::DescriptorSetLayoutBinding {
                binding: (slot * 2 + 1) as u32,
                descriptor_type: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            });
        }
        let uses_textures = !set1_bindings.is_empty();

        let create_set_layout = |bindings: &[vk::DescriptorSetLayoutBinding]| {
            let layout_info = vk::DescriptorSetLayoutCreateInfo {
                binding_count: bindings.len() as u32,
                p_bindings: bindings.as_ptr(),
                ..Default::default()
            };
            unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(|e| RhiError::PipelineCreationFailed(e.to_string()))
        };
        // Set 0 always exists, even empty, so set indices match shader
        // groups. Set 1 only when the material samples textures.
        let mut set_layouts = vec![create_set_layout(&set0_bindings)?];
        if uses_textures {
            set_layouts.push(create_set_layout(&set1_bindings)?);
        }

        let pipeline_layout_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: set_layouts.len() as u32,
            p_set_layouts: set_layouts.as_ptr(),
            ..Default::default()
        };
        let pipeline_layout = unsafe {
            self.device
                .create_pipeline_layout(&pipeline_layout_info, None)
        }
        .map_err(|e| RhiError::PipelineCreationFailed(e.to_string()))?;

        // Allocate and write descriptor sets.
        let mut uniform_sets = Vec::with_capacity(self.frames_in_flight);
        for slot in 0..self.frames_in_flight {
            let alloc_info = vk::DescriptorSetAllocateInfo {
                descriptor_pool: self.descriptor_pool,
                descriptor_set_count: 1,
                p_set_layouts: &set_layouts[0],
                ..Default::default()
            };
            let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
                .map_err(|e| RhiError::PipelineCreationFailed(e.to_string()))?[0];
            let buffer_infos: Vec<vk::DescriptorBufferInfo> = uniforms
                .iter()
                .map(|u| vk::DescriptorBufferInfo {
                    buffer: u.per_slot[slot].buffer,
                    offset: 0,
                    range: u.per_slot[slot].size,
                })
                .collect();
            let writes: Vec<vk::WriteDescriptorSet> = uniforms
                .iter()
                .zip(&buffer_infos)
                .map(|(u, info)| vk::WriteDescriptorSet {
                    dst_set: set,
                    dst_binding: u.binding,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: info,
                    ..Default::default()
                })
                .collect();
            unsafe { self.device.update_descriptor_sets(&writes, &[]) };
            uniform_sets.push(set);
        }

        let texture_set = if uses_textures {
            let alloc_info = vk::DescriptorSetAllocateInfo {
                descriptor_pool: self.descriptor_pool,
                descriptor_set_count: 1,
                p_set_layouts: &set_layouts[1],
                ..Default::default()
            };
            let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
                .map_err(|e| RhiError::PipelineCreationFailed(e.to_string()))?[0];
            let mut image_infos = Vec::new();
            for (texture_id, sampler_key) in texture_ids.iter().zip(&sampler_keys) {
                let view = self
                    .textures
                    .get(texture_id)
                    .map(|t| t.view)
                    .unwrap_or(vk::ImageView::null());
                let sampler = self.sampler_cache.get(*sampler_key).unwrap_or_default();
                image_infos.push((
                    vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    },
                    vk::DescriptorImageInfo {
                        sampler,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    },
                ));
            }
            let mut writes = Vec::new();
            for (slot, (image_info, sampler_info)) in image_infos.iter().enumerate() {
                writes.push(vk::WriteDescriptorSet {
                    dst_set: set,
                    dst_binding: (slot * 2) as u32,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                    p_image_info: image_info,
                    ..Default::default()
                });
                writes.push(vk::WriteDescriptorSet {
                    dst_set: set,
                    dst_binding: (slot * 2 + 1) as u32,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::SAMPLER,
                    p_image_info: sampler_info,
                    ..Default::default()
                });
            }
            unsafe { self.device.update_descriptor_sets(&writes, &[]) };
            Some(set)
        } else {
            None
        };

        self.renderables.insert(
            renderable.id(),
            VkRenderable {
                vertex_buffer: vertex_id,
                index_buffer,
                draw_count,
                vertex_layout,
                render_state: *material.render_state(),
                shader_ids,
                texture_ids,
                sampler_keys,
                set_layouts,
                pipeline_layout,
                uniforms,
                uniform_sets,
                texture_set,
                binder,
                pipelines: Vec::new(),
            },
        );
        Ok(())
    }

    fn unbind_renderable(&mut self, renderable: &Renderable) -> RhiResult<()> {
        let Some(record) = self.renderables.remove(&renderable.id()) else {
            return Ok(());
        };
        // The GPU may still read these; teardown at the facade level waits
        // for idle before releasing whole scenes.
        for key in record.pipelines {
            let device = &self.device;
            self.pipeline_cache.release(key, |pipeline| unsafe {
                device.destroy_pipeline(pipeline, None);
            });
        }
        for key in record.sampler_keys {
            let device = &self.device;
            self.sampler_cache.release(key, |sampler| unsafe {
                device.destroy_sampler(sampler, None);
            });
        }
        unsafe {
            let mut sets = record.uniform_sets.clone();
            if let Some(set) = record.texture_set {
                sets.push(set);
            }
            let _ = self.device.free_descriptor_sets(self.descriptor_pool, &sets);
            self.device
                .destroy_pipeline_layout(record.pipeline_layout, None);
            for layout in record.set_layouts {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
        for uniform in record.uniforms {
            for buffer in uniform.per_slot {
                self.destroy_vk_buffer(buffer);
            }
        }
        for id in record.texture_ids {
            self.release_texture(id);
        }
        for id in record.shader_ids {
            self.release_shader(id);
        }
        if let Some(buffer) = self.buffers.remove(&record.vertex_buffer) {
            self.destroy_vk_buffer(buffer);
        }
        if let Some((id, _)) = record.index_buffer {
            if let Some(buffer) = self.buffers.remove(&id) {
                self.destroy_vk_buffer(buffer);
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
        if self.pass_target.is_none() {
            log::warn!("draw outside an active render pass, skipping");
            return Ok(());
        }

        let mesh = renderable.mesh_mut();
        if mesh.vertex_buffer().is_dirty() {
            if mesh.vertex_buffer().usage().contains(BufferUsage::DYNAMIC) {
                let id = mesh.vertex_buffer().id();
                if let Some(buffer) = self.buffers.get_mut(&id) {
                    Self::write_vk_buffer(buffer, mesh.vertex_buffer().data());
                    self.buffer_uploads += 1;
                }
            } else {
                log::warn!("static vertex buffer marked dirty after initial upload, ignoring");
            }
            mesh.vertex_buffer_mut().mark_clean();
        }
        if mesh.index_buffer().is_some_and(|i| i.is_dirty()) {
            match mesh
                .index_buffer()
                .filter(|i| i.usage().contains(BufferUsage::DYNAMIC))
            {
                Some(indices) => {
                    if let Some(buffer) = self.buffers.get_mut(&indices.id()) {
                        Self::write_vk_buffer(buffer, indices.data());
                        self.buffer_uploads += 1;
                    }
                }
                None => {
                    log::warn!("static index buffer marked dirty after initial upload, ignoring")
                }
            }
            if let Some(indices) = mesh.index_buffer_mut() {
                indices.mark_clean();
            }
        }

        let (color_format, has_depth) = match self.pass_target {
            Some(Some(target_id)) => match self.targets.get(&target_id) {
                Some(target) => (target.color_format, target.has_depth),
                None => (convert_format_back(self.swapchain_format), true),
            },
            _ => (convert_format_back(self.swapchain_format), true),
        };
        let render_pass = self.active_render_pass;
        let slot_index = self.current_slot;

        let record = match self.renderables.get_mut(&renderable.id()) {
            Some(record) => record,
            None => return Ok(()),
        };

        record.binder.set_frame_params(frame);
        let uniforms = &mut record.uniforms;
        let uploaded = record.binder.flush(|layout, bytes| {
            if let Some(slot_buffers) = uniforms
                .iter_mut()
                .find(|u| (u.group, u.binding) == (layout.group, layout.binding))
            {
                Self::write_vk_buffer(&mut slot_buffers.per_slot[slot_index], bytes);
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
            has_depth,
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
            let pipeline_layout = record.pipeline_layout;
            let result = self.pipeline_cache.acquire(key, || {
                Self::create_pipeline(
                    device,
                    shaders,
                    &key,
                    vertex_layout,
                    render_state,
                    pipeline_layout,
                    render_pass,
                )
            });
            match result {
                Ok(pipeline) => {
                    record.pipelines.push(key);
                    pipeline
                }
                Err(e) => {
                    debug_assert!(false, "pipeline creation failed: {e}");
                    log::warn!("pipeline creation failed, skipping draw: {e}");
                    return Ok(());
                }
            }
        };

        let cmd = self.slots[slot_index].command_buffer;
        let vertex_buffer = match self.buffers.get(&record.vertex_buffer) {
            Some(buffer) => buffer.buffer,
            None => {
                log::warn!("draw references missing vertex buffer, skipping");
                return Ok(());
            }
        };
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            let mut sets = vec![record.uniform_sets[slot_index]];
            if let Some(texture_set) = record.texture_set {
                sets.push(texture_set);
            }
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                record.pipeline_layout,
                0,
                &sets,
                &[],
            );
            self.device
                .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
            match record.index_buffer {
                Some((id, index_type)) => {
                    let index_buffer = match self.buffers.get(&id) {
                        Some(buffer) => buffer.buffer,
                        None => {
                            log::warn!("draw references missing index buffer, skipping");
                            return Ok(());
                        }
                    };
                    self.device
                        .cmd_bind_index_buffer(cmd, index_buffer, 0, index_type);
                    self.device
                        .cmd_draw_indexed(cmd, record.draw_count, 1, 0, 0, 0);
                }
                None => {
                    self.device.cmd_draw(cmd, record.draw_count, 1, 0, 0);
                }
            }
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

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        if !self.renderables.is_empty() {
            log::warn!(
                "vulkan backend dropped with {} renderables still bound",
                self.renderables.len()
            );
        }
        let renderable_ids: Vec<ResourceId> = self.renderables.keys().copied().collect();
        for id in renderable_ids {
            if let Some(record) = self.renderables.remove(&id) {
                unsafe {
                    self.device
                        .destroy_pipeline_layout(record.pipeline_layout, None);
                    for layout in record.set_layouts {
                        self.device.destroy_descriptor_set_layout(layout, None);
                    }
                }
                for uniform in record.uniforms {
                    for buffer in uniform.per_slot {
                        self.destroy_vk_buffer(buffer);
                    }
                }
            }
        }
        let buffer_ids: Vec<ResourceId> = self.buffers.keys().copied().collect();
        for id in buffer_ids {
            if let Some(buffer) = self.buffers.remove(&id) {
                self.destroy_vk_buffer(buffer);
            }
        }
        let texture_ids: Vec<ResourceId> = self.textures.keys().copied().collect();
        for id in texture_ids {
            if let Some(texture) = self.textures.remove(&id) {
                self.destroy_vk_texture(texture);
            }
        }
        if let Some(depth) = self.depth_image.take() {
            self.destroy_vk_texture(depth);
        }
        unsafe {
            for (_, shader) in self.shaders.drain() {
                self.device.destroy_shader_module(shader.module, None);
            }
            for (_, target) in self.targets.drain() {
                self.device.destroy_framebuffer(target.framebuffer, None);
                self.device.destroy_render_pass(target.pass_clear, None);
                self.device.destroy_render_pass(target.pass_load, None);
            }
            for pipeline in self.pipeline_cache.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for sampler in self.sampler_cache.drain() {
                self.device.destroy_sampler(sampler, None);
            }

            // Allocator must go before the device.
            drop(self.allocator.take());

            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            for slot in &self.slots {
                self.device.destroy_semaphore(slot.image_available, None);
                self.device.destroy_semaphore(slot.render_finished, None);
                self.device.destroy_fence(slot.in_flight, None);
            }
            self.device
                .destroy_render_pass(self.surface_pass_clear, None);
            self.device.destroy_render_pass(self.surface_pass_load, None);
            for &framebuffer in &self.swapchain_framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            }
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
