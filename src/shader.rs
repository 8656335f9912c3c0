//! Shaders: WGSL sources with an explicit pipeline-stage role, compiled and
//! reflected through naga.
//!
//! Compilation is backend-neutral: every backend parses and validates the
//! source the same way and consumes the reflected uniform layout; the Vulkan
//! backend additionally lowers the validated module to SPIR-V.

use naga::valid::{Capabilities, ValidationFlags};

use crate::backend::ResourceId;
use crate::error::{RhiError, RhiResult};

/// Pipeline stage a shader is written for. Carried explicitly on the shader,
/// never inferred from names or file extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }

    fn default_entry_point(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vs_main",
            ShaderStage::Fragment => "fs_main",
        }
    }
}

/// Fallback source substituted when a shader fails to compile: passes
/// positions through and paints solid magenta.
pub const ERROR_SHADER_SOURCE: &str = r#"
@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 1.0, 1.0);
}
"#;

/// A WGSL shader source plus the metadata backends need to compile it.
#[derive(Debug, Clone)]
pub struct Shader {
    id: ResourceId,
    name: String,
    stage: ShaderStage,
    source: String,
    entry_point: String,
    defines: Vec<(String, u32)>,
}

impl Shader {
    pub fn new(name: impl Into<String>, stage: ShaderStage, source: impl Into<String>) -> Self {
        Self {
            id: ResourceId::allocate(),
            name: name.into(),
            stage,
            source: source.into(),
            entry_point: stage.default_entry_point().to_string(),
            defines: Vec::new(),
        }
    }

    pub fn vertex(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, ShaderStage::Vertex, source)
    }

    pub fn fragment(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, ShaderStage::Fragment, source)
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Adds a compile-time constant, emitted as a WGSL `const` ahead of the
    /// source.
    pub fn with_define(mut self, name: impl Into<String>, value: u32) -> Self {
        self.defines.push((name.into(), value));
        self
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// The source with defines prepended, as handed to the compiler.
    pub fn preprocessed_source(&self) -> String {
        if self.defines.is_empty() {
            return self.source.clone();
        }
        let mut out = String::new();
        for (name, value) in &self.defines {
            out.push_str(&format!("const {name}: u32 = {value}u;\n"));
        }
        out.push_str(&self.source);
        out
    }
}

static_assertions::assert_impl_all!(Shader: Send, Sync);

/// One member of a reflected uniform buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// One uniform buffer a shader actually reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBufferLayout {
    pub name: String,
    pub group: u32,
    pub binding: u32,
    pub size_bytes: u32,
    pub members: Vec<UniformMember>,
}

impl UniformBufferLayout {
    pub fn find_member(&self, name: &str) -> Option<&UniformMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Abstract reflection of a compiled shader.
///
/// Only uniform globals the entry point actually uses are listed; buffers the
/// compiler proves untouched never get shadow copies or uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReflectedLayout {
    pub uniform_buffers: Vec<UniformBufferLayout>,
    /// Sampled texture bindings the entry point uses: (group, binding).
    pub sampled_textures: Vec<(u32, u32)>,
    /// Vertex input locations (vertex stage only): (location, argument name).
    pub vertex_inputs: Vec<(u32, String)>,
}

impl ReflectedLayout {
    pub fn find_buffer(&self, name: &str) -> Option<&UniformBufferLayout> {
        self.uniform_buffers.iter().find(|b| b.name == name)
    }

    /// Checks a mesh vertex layout against the inputs the vertex stage
    /// declares. The attribute at index `i` feeds `@location(i)`, so every
    /// reflected input location needs an attribute slot under it.
    pub fn check_vertex_layout(&self, layout: &crate::mesh::VertexLayout) -> RhiResult<()> {
        let slots = layout.attributes().len() as u32;
        for (location, name) in &self.vertex_inputs {
            if *location >= slots {
                return Err(RhiError::InvalidParameter(format!(
                    "vertex shader input '{name}' at location {location} has no attribute \
                     in the mesh layout ({slots} attributes)"
                )));
            }
        }
        Ok(())
    }
}

/// A parsed, validated shader module plus its reflection.
#[derive(Debug)]
pub struct ShaderModule {
    pub(crate) module: naga::Module,
    pub(crate) info: naga::valid::ModuleInfo,
    pub entry_point: String,
    pub stage: ShaderStage,
    pub layout: ReflectedLayout,
}

/// Parses, validates and reflects a shader.
///
/// Errors carry the full compiler diagnostic; callers decide whether the
/// failure is fatal (the error shader at init) or degradable (user shaders).
pub fn compile_shader(shader: &Shader) -> RhiResult<ShaderModule> {
    let source = shader.preprocessed_source();

    let module = naga::front::wgsl::parse_str(&source).map_err(|e| {
        RhiError::ShaderCompilationFailed(format!(
            "'{}': {}",
            shader.name(),
            e.emit_to_string(&source)
        ))
    })?;

    let info = naga::valid::Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| {
            RhiError::ShaderCompilationFailed(format!(
                "'{}': {}",
                shader.name(),
                e.emit_to_string(&source)
            ))
        })?;

    let (ep_index, entry_point) = module
        .entry_points
        .iter()
        .enumerate()
        .find(|(_, ep)| ep.stage == shader.stage().to_naga() && ep.name == shader.entry_point())
        .map(|(i, ep)| (i, ep))
        .ok_or_else(|| {
            RhiError::ShaderCompilationFailed(format!(
                "'{}': no {:?} entry point named '{}'",
                shader.name(),
                shader.stage(),
                shader.entry_point()
            ))
        })?;

    let layout = reflect(&module, &info, ep_index, entry_point);

    Ok(ShaderModule {
        entry_point: shader.entry_point().to_string(),
        stage: shader.stage(),
        layout,
        module,
        info,
    })
}

fn reflect(
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
    ep_index: usize,
    entry_point: &naga::EntryPoint,
) -> ReflectedLayout {
    let ep_info = info.get_entry_point(ep_index);
    let mut uniform_buffers = Vec::new();
    let mut sampled_textures = Vec::new();

    for (handle, global) in module.global_variables.iter() {
        // Skip globals this entry point never touches.
        if ep_info[handle].is_empty() {
            continue;
        }
        let Some(binding) = &global.binding else {
            continue;
        };
        if global.space == naga::AddressSpace::Handle {
            if let naga::TypeInner::Image { .. } = module.types[global.ty].inner {
                sampled_textures.push((binding.group, binding.binding));
            }
            continue;
        }
        if global.space != naga::AddressSpace::Uniform {
            continue;
        }
        let name = global
            .name
            .clone()
            .unwrap_or_else(|| format!("uniform_{}", binding.binding));
        let ty = &module.types[global.ty];
        let size_bytes = ty.inner.size(module.to_ctx());

        let members = match &ty.inner {
            naga::TypeInner::Struct { members, .. } => members
                .iter()
                .map(|m| UniformMember {
                    name: m.name.clone().unwrap_or_default(),
                    offset: m.offset,
                    size: module.types[m.ty].inner.size(module.to_ctx()),
                })
                .collect(),
            // Non-struct uniforms reflect as a single anonymous member.
            _ => vec![UniformMember {
                name: name.clone(),
                offset: 0,
                size: size_bytes,
            }],
        };

        uniform_buffers.push(UniformBufferLayout {
            name,
            group: binding.group,
            binding: binding.binding,
            size_bytes,
            members,
        });
    }

    let mut vertex_inputs = Vec::new();
    if entry_point.stage == naga::ShaderStage::Vertex {
        for arg in &entry_point.function.arguments {
            if let Some(naga::Binding::Location { location, .. }) = &arg.binding {
                vertex_inputs.push((*location, arg.name.clone().unwrap_or_default()));
            }
        }
    }

    ReflectedLayout {
        uniform_buffers,
        sampled_textures,
        vertex_inputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SHADER: &str = r#"
struct Globals {
    world: mat4x4<f32>,
    tint: vec4<f32>,
};
@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var<uniform> untouched: vec4<f32>;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return globals.world * vec4<f32>(position, 1.0);
}
"#;

    #[test]
    fn test_reflection_offsets() {
        let shader = Shader::vertex("test", TEST_SHADER);
        let module = compile_shader(&shader).unwrap();
        let globals = module.layout.find_buffer("globals").unwrap();
        assert_eq!(globals.group, 0);
        assert_eq!(globals.binding, 0);
        assert_eq!(globals.size_bytes, 80);
        let world = globals.find_member("world").unwrap();
        assert_eq!((world.offset, world.size), (0, 64));
        let tint = globals.find_member("tint").unwrap();
        assert_eq!((tint.offset, tint.size), (64, 16));
    }

    #[test]
    fn test_unused_uniform_skipped() {
        let shader = Shader::vertex("test", TEST_SHADER);
        let module = compile_shader(&shader).unwrap();
        assert!(module.layout.find_buffer("untouched").is_none());
        assert_eq!(module.layout.uniform_buffers.len(), 1);
    }

    #[test]
    fn test_vertex_inputs_reflected() {
        let shader = Shader::vertex("test", TEST_SHADER);
        let module = compile_shader(&shader).unwrap();
        assert_eq!(module.layout.vertex_inputs, vec![(0, "position".to_string())]);
    }

    #[test]
    fn test_vertex_layout_mismatch_detected() {
        use crate::mesh::{VertexAttribute, VertexAttributeFormat, VertexLayout, VertexSemantic};

        let source = r#"
@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position + normal + vec3<f32>(uv, 0.0), 1.0);
}
"#;
        let module = compile_shader(&Shader::vertex("lit", source)).unwrap();
        assert!(module
            .layout
            .check_vertex_layout(&VertexLayout::position_normal_uv())
            .is_ok());

        let position_only = VertexLayout::new(vec![VertexAttribute {
            semantic: VertexSemantic::Position,
            format: VertexAttributeFormat::Float32x3,
        }])
        .unwrap();
        let err = module.layout.check_vertex_layout(&position_only).unwrap_err();
        match err {
            RhiError::InvalidParameter(msg) => assert!(msg.contains("location 1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_sampled_textures_reflected() {
        let source = r#"
@group(1) @binding(0) var t_albedo: texture_2d<f32>;
@group(1) @binding(1) var s_albedo: sampler;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(t_albedo, s_albedo, uv);
}
"#;
        let shader = Shader::fragment("textured", source);
        let module = compile_shader(&shader).unwrap();
        assert_eq!(module.layout.sampled_textures, vec![(1, 0)]);
    }

    #[test]
    fn test_invalid_source_reports_diagnostic() {
        let shader = Shader::fragment("broken", "this is not wgsl");
        let err = compile_shader(&shader).unwrap_err();
        match err {
            RhiError::ShaderCompilationFailed(msg) => assert!(msg.contains("broken")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_entry_point() {
        let shader = Shader::fragment("wrong-stage", TEST_SHADER);
        assert!(matches!(
            compile_shader(&shader),
            Err(RhiError::ShaderCompilationFailed(_))
        ));
    }

    #[test]
    fn test_defines_prepended() {
        let source = r#"
@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(f32(LIGHT_COUNT), 0.0, 0.0, 1.0);
}
"#;
        let shader = Shader::fragment("lit", source).with_define("LIGHT_COUNT", 4);
        assert!(shader.preprocessed_source().starts_with("const LIGHT_COUNT"));
        assert!(compile_shader(&shader).is_ok());
    }

    #[test]
    fn test_error_shader_always_compiles() {
        let vs = Shader::vertex("error", ERROR_SHADER_SOURCE);
        let fs = Shader::fragment("error", ERROR_SHADER_SOURCE);
        assert!(compile_shader(&vs).is_ok());
        assert!(compile_shader(&fs).is_ok());
    }
}
