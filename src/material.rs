//! Materials: shader pair, textures, named parameters and fixed-function
//! state, shared between renderables through `Arc`.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::error::{RhiError, RhiResult};
use crate::shader::{Shader, ShaderStage};
use crate::texture::Texture;
use crate::types::{RenderState, SamplerDescriptor};

/// A typed shader-parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    F32(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl ParamValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ParamValue::F32(v) => bytemuck::bytes_of(v),
            ParamValue::Vec2(v) => bytemuck::bytes_of(v),
            ParamValue::Vec3(v) => bytemuck::bytes_of(v),
            ParamValue::Vec4(v) => bytemuck::bytes_of(v),
            ParamValue::Mat4(v) => bytemuck::bytes_of(v),
        }
    }
}

/// A texture slot with its sampling configuration. Slot order is the binding
/// order the fragment shader sees.
#[derive(Debug, Clone)]
pub struct TextureBinding {
    pub texture: Arc<Texture>,
    pub sampler: SamplerDescriptor,
}

/// Builder for [`Material`].
#[derive(Debug, Clone)]
pub struct MaterialDescriptor {
    name: String,
    vertex_shader: Arc<Shader>,
    fragment_shader: Arc<Shader>,
    textures: Vec<TextureBinding>,
    params: Vec<(String, ParamValue)>,
    render_state: RenderState,
}

impl MaterialDescriptor {
    pub fn new(
        name: impl Into<String>,
        vertex_shader: Arc<Shader>,
        fragment_shader: Arc<Shader>,
    ) -> Self {
        Self {
            name: name.into(),
            vertex_shader,
            fragment_shader,
            textures: Vec::new(),
            params: Vec::new(),
            render_state: RenderState::default(),
        }
    }

    pub fn with_texture(mut self, texture: Arc<Texture>, sampler: SamplerDescriptor) -> Self {
        self.textures.push(TextureBinding { texture, sampler });
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.push((name.into(), value));
        self
    }

    pub fn with_render_state(mut self, render_state: RenderState) -> Self {
        self.render_state = render_state;
        self
    }
}

/// An immutable, shareable material. Renderables hold it via `Arc`; backend
/// state objects it requests are refcounted per bound renderable.
#[derive(Debug)]
pub struct Material {
    name: String,
    vertex_shader: Arc<Shader>,
    fragment_shader: Arc<Shader>,
    textures: Vec<TextureBinding>,
    params: Vec<(String, ParamValue)>,
    render_state: RenderState,
}

impl Material {
    pub fn new(descriptor: MaterialDescriptor) -> RhiResult<Self> {
        if descriptor.vertex_shader.stage() != ShaderStage::Vertex {
            return Err(RhiError::InvalidParameter(format!(
                "material '{}': shader '{}' is not a vertex shader",
                descriptor.name,
                descriptor.vertex_shader.name()
            )));
        }
        if descriptor.fragment_shader.stage() != ShaderStage::Fragment {
            return Err(RhiError::InvalidParameter(format!(
                "material '{}': shader '{}' is not a fragment shader",
                descriptor.name,
                descriptor.fragment_shader.name()
            )));
        }
        Ok(Self {
            name: descriptor.name,
            vertex_shader: descriptor.vertex_shader,
            fragment_shader: descriptor.fragment_shader,
            textures: descriptor.textures,
            params: descriptor.params,
            render_state: descriptor.render_state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertex_shader(&self) -> &Arc<Shader> {
        &self.vertex_shader
    }

    pub fn fragment_shader(&self) -> &Arc<Shader> {
        &self.fragment_shader
    }

    pub fn textures(&self) -> &[TextureBinding] {
        &self.textures
    }

    pub fn params(&self) -> &[(String, ParamValue)] {
        &self.params
    }

    pub fn render_state(&self) -> &RenderState {
        &self.render_state
    }
}

static_assertions::assert_impl_all!(Material: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ERROR_SHADER_SOURCE;

    fn test_shaders() -> (Arc<Shader>, Arc<Shader>) {
        (
            Arc::new(Shader::vertex("vs", ERROR_SHADER_SOURCE)),
            Arc::new(Shader::fragment("fs", ERROR_SHADER_SOURCE)),
        )
    }

    #[test]
    fn test_material_builder() {
        let (vs, fs) = test_shaders();
        let texture = Arc::new(Texture::solid_color([255, 255, 255, 255]).unwrap());
        let material = Material::new(
            MaterialDescriptor::new("unlit", vs, fs)
                .with_texture(texture, SamplerDescriptor::default())
                .with_param("u_tint", ParamValue::Vec4(Vec4::ONE)),
        )
        .unwrap();
        assert_eq!(material.name(), "unlit");
        assert_eq!(material.textures().len(), 1);
        assert_eq!(material.params().len(), 1);
    }

    #[test]
    fn test_stage_mismatch_rejected() {
        let (vs, fs) = test_shaders();
        let result = Material::new(MaterialDescriptor::new("swapped", fs, vs));
        assert!(matches!(result, Err(RhiError::InvalidParameter(_))));
    }

    #[test]
    fn test_param_bytes() {
        let value = ParamValue::Vec4(Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(value.as_bytes().len(), 16);
        assert_eq!(ParamValue::Mat4(Mat4::IDENTITY).as_bytes().len(), 64);
    }
}
