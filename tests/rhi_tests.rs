//! Integration tests for the rhi crate.
//!
//! These run against the headless backend, which implements the full backend
//! contract (state caches, parameter binder, frame lifecycle, stats) without
//! touching a GPU, so every test here runs on any machine.
//!
//! Tests over fixed-function state are parameterized with `rstest` so each
//! state combination exercises its own cache keys.

use std::sync::Arc;

use rstest::rstest;

use rhi::{
    BlendState, BufferKind, BufferUsage, CullMode, DeviceBuffer, Material, MaterialDescriptor,
    Mesh, ParamValue, RenderState, Renderable, Rhi, RhiConfig, RhiError, SamplerDescriptor,
    Shader, StencilState, SurfaceTarget, Texture, Vertex, VertexAttribute,
    VertexAttributeFormat, VertexLayout, VertexSemantic,
};

const TEST_SHADER: &str = r#"
struct Globals {
    u_world_view_proj: mat4x4<f32>,
    u_tint: vec4<f32>,
};
@group(0) @binding(0) var<uniform> globals: Globals;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
) -> VsOut {
    var out: VsOut;
    out.position = globals.u_world_view_proj * vec4<f32>(position, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    return globals.u_tint;
}
"#;

fn headless() -> Rhi {
    match Rhi::new(&RhiConfig::default(), SurfaceTarget::offscreen(64, 64)) {
        Ok(rhi) => rhi,
        Err(e) => panic!("headless backend init failed: {e}"),
    }
}

fn test_material(state: RenderState) -> Arc<Material> {
    let vs = Arc::new(Shader::vertex("test_vs", TEST_SHADER));
    let fs = Arc::new(Shader::fragment("test_fs", TEST_SHADER));
    let material = Material::new(
        MaterialDescriptor::new("test", vs, fs)
            .with_param("u_tint", ParamValue::Vec4(glam::Vec4::ONE))
            .with_render_state(state),
    )
    .unwrap();
    Arc::new(material)
}

fn textured_material() -> Arc<Material> {
    let vs = Arc::new(Shader::vertex("test_vs", TEST_SHADER));
    let fs = Arc::new(Shader::fragment("test_fs", TEST_SHADER));
    let texture = Arc::new(Texture::solid_color([255, 255, 255, 255]).unwrap());
    let material = Material::new(
        MaterialDescriptor::new("textured", vs, fs)
            .with_texture(texture, SamplerDescriptor::default())
            .with_param("u_tint", ParamValue::Vec4(glam::Vec4::ONE)),
    )
    .unwrap();
    Arc::new(material)
}

fn test_renderable(material: Arc<Material>) -> Renderable {
    Renderable::new(Mesh::cube().unwrap(), material).unwrap()
}

fn stencil_state() -> RenderState {
    RenderState {
        stencil: Some(StencilState::default()),
        ..RenderState::default()
    }
}

fn alpha_state() -> RenderState {
    RenderState {
        blend: Some(BlendState::alpha_blending()),
        ..RenderState::default()
    }
}

fn additive_state() -> RenderState {
    RenderState {
        blend: Some(BlendState::additive()),
        cull_mode: CullMode::None,
        ..RenderState::default()
    }
}

// ============================================================================
// State Cache Tests
// ============================================================================

/// Binding a renderable populates one entry per state-cache class and
/// unbinding releases every one of them, whatever the requested state.
#[rstest]
#[case::default_state(RenderState::default())]
#[case::alpha_blending(alpha_state())]
#[case::additive_no_cull(additive_state())]
#[case::stencil(stencil_state())]
fn test_bind_unbind_leaves_caches_empty(#[case] state: RenderState) {
    let mut rhi = headless();
    let mut renderable = test_renderable(test_material(state));

    rhi.bind_renderable(&mut renderable).unwrap();
    let stats = rhi.stats();
    assert_eq!(stats.rasterizer_states, 1);
    assert_eq!(stats.blend_states, 1);
    assert_eq!(stats.depth_stencil_states, 1);
    assert_eq!(stats.input_layouts, 1);
    assert!(rhi.is_renderable_bound(&renderable));

    rhi.unbind_renderable(&renderable).unwrap();
    assert!(!rhi.is_renderable_bound(&renderable));
    assert!(rhi.stats().state_caches_empty());
}

/// Two renderables with identical fixed-function state share one native
/// object per cache class; releasing one keeps the shared entries alive.
#[test]
fn test_identical_state_shares_cache_entries() {
    let mut rhi = headless();
    let material = test_material(RenderState::default());
    let mut a = test_renderable(material.clone());
    let mut b = test_renderable(material);

    rhi.bind_renderable(&mut a).unwrap();
    rhi.bind_renderable(&mut b).unwrap();
    let stats = rhi.stats();
    assert_eq!(stats.rasterizer_states, 1);
    assert_eq!(stats.blend_states, 1);
    assert_eq!(stats.depth_stencil_states, 1);
    assert_eq!(stats.input_layouts, 1);

    rhi.unbind_renderable(&a).unwrap();
    assert_eq!(rhi.stats().rasterizer_states, 1);

    rhi.unbind_renderable(&b).unwrap();
    assert!(rhi.stats().state_caches_empty());
}

/// Different blend states resolve to different cache entries while the
/// rasterizer state stays shared.
#[test]
fn test_distinct_state_gets_distinct_entries() {
    let mut rhi = headless();
    let mut opaque = test_renderable(test_material(RenderState::default()));
    let mut blended = test_renderable(test_material(alpha_state()));

    rhi.bind_renderable(&mut opaque).unwrap();
    rhi.bind_renderable(&mut blended).unwrap();
    let stats = rhi.stats();
    assert_eq!(stats.blend_states, 2);
    assert_eq!(stats.rasterizer_states, 1);

    rhi.unbind_renderable(&opaque).unwrap();
    rhi.unbind_renderable(&blended).unwrap();
    assert!(rhi.stats().state_caches_empty());
}

/// Texture samplers are cached like any other state object.
#[test]
fn test_sampler_cached_and_released() {
    let mut rhi = headless();
    let mut renderable = test_renderable(textured_material());

    rhi.bind_renderable(&mut renderable).unwrap();
    assert_eq!(rhi.stats().samplers, 1);

    rhi.unbind_renderable(&renderable).unwrap();
    assert!(rhi.stats().state_caches_empty());
}

// ============================================================================
// Buffer Upload Tests
// ============================================================================

/// Binding uploads the vertex and index streams exactly once; subsequent
/// draws of clean buffers upload nothing.
#[test]
fn test_bind_uploads_mesh_buffers_once() {
    let mut rhi = headless();
    let mut renderable = test_renderable(test_material(RenderState::default()));

    rhi.bind_renderable(&mut renderable).unwrap();
    assert_eq!(rhi.stats().buffer_uploads, 2);

    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.end_frame().unwrap();
    assert_eq!(rhi.stats().buffer_uploads, 2);
    assert_eq!(rhi.stats().draw_calls, 2);
}

/// A dynamic vertex buffer written after binding is re-uploaded exactly once
/// on the next draw, then stays clean.
#[test]
fn test_dirty_dynamic_buffer_reuploaded_once() {
    let mut rhi = headless();
    let vertices = [Vertex {
        position: [0.0; 3],
        normal: [0.0, 1.0, 0.0],
        uv: [0.0; 2],
    }; 3];
    let vertex_buffer =
        DeviceBuffer::from_slice(BufferKind::Vertex, &vertices, BufferUsage::DYNAMIC).unwrap();
    let mesh = Mesh::new(VertexLayout::position_normal_uv(), vertex_buffer, None).unwrap();
    let mut renderable =
        Renderable::new(mesh, test_material(RenderState::default())).unwrap();

    rhi.bind_renderable(&mut renderable).unwrap();
    assert_eq!(rhi.stats().buffer_uploads, 1);

    let moved = Vertex {
        position: [1.0, 0.0, 0.0],
        normal: [0.0, 1.0, 0.0],
        uv: [0.0; 2],
    };
    renderable
        .mesh_mut()
        .vertex_buffer_mut()
        .write(0, &[moved])
        .unwrap();
    assert!(renderable.mesh().vertex_buffer().is_dirty());

    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.end_frame().unwrap();
    assert_eq!(rhi.stats().buffer_uploads, 2);
    assert!(!renderable.mesh().vertex_buffer().is_dirty());
}

/// Writing to a STATIC buffer after its initial upload is ignored at draw:
/// the dirty flag is cleared with a warning and nothing is re-uploaded.
#[test]
fn test_dirty_static_buffer_not_reuploaded() {
    let mut rhi = headless();
    let mut renderable = test_renderable(test_material(RenderState::default()));

    rhi.bind_renderable(&mut renderable).unwrap();
    assert_eq!(rhi.stats().buffer_uploads, 2);

    // Mesh::cube() builds STATIC vertex and index streams.
    renderable.mesh_mut().vertex_buffer_mut().set_dirty();
    assert!(renderable.mesh().vertex_buffer().is_dirty());

    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.end_frame().unwrap();

    assert_eq!(rhi.stats().buffer_uploads, 2);
    assert!(!renderable.mesh().vertex_buffer().is_dirty());
}

// ============================================================================
// Parameter Binder Tests
// ============================================================================

/// The uniform shadow copy reaches the device once at the first draw and is
/// not re-uploaded while nothing changes.
#[test]
fn test_uniforms_upload_once_when_unchanged() {
    let mut rhi = headless();
    let mut renderable = test_renderable(test_material(RenderState::default()));
    rhi.bind_renderable(&mut renderable).unwrap();

    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    assert_eq!(rhi.stats().uniform_uploads, 1);
    rhi.render_mesh(&mut renderable).unwrap();
    assert_eq!(rhi.stats().uniform_uploads, 1);
    rhi.end_frame().unwrap();

    // Same parameters next frame: still nothing to upload.
    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.end_frame().unwrap();
    assert_eq!(rhi.stats().uniform_uploads, 1);
}

/// Changing the world matrix dirties `u_world_view_proj` and triggers
/// exactly one more upload.
#[test]
fn test_changed_frame_params_trigger_upload() {
    let mut rhi = headless();
    let mut renderable = test_renderable(test_material(RenderState::default()));
    rhi.bind_renderable(&mut renderable).unwrap();

    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    assert_eq!(rhi.stats().uniform_uploads, 1);

    rhi.set_world_matrix(glam::Mat4::from_translation(glam::Vec3::X));
    rhi.render_mesh(&mut renderable).unwrap();
    assert_eq!(rhi.stats().uniform_uploads, 2);
    rhi.render_mesh(&mut renderable).unwrap();
    assert_eq!(rhi.stats().uniform_uploads, 2);
    rhi.end_frame().unwrap();
}

// ============================================================================
// Shader Error Tests
// ============================================================================

/// A shader that fails to compile is replaced by the error shader: binding
/// succeeds, the substitution is counted and drawing still works.
#[test]
fn test_error_shader_substitution() {
    let mut rhi = headless();
    let vs = Arc::new(Shader::vertex("good_vs", TEST_SHADER));
    let fs = Arc::new(Shader::fragment("broken_fs", "this is not wgsl"));
    let material = Arc::new(
        Material::new(MaterialDescriptor::new("broken", vs.clone(), fs.clone())).unwrap(),
    );
    let mut renderable = test_renderable(material);

    rhi.bind_renderable(&mut renderable).unwrap();
    assert_eq!(rhi.stats().error_shader_substitutions, 1);
    assert!(rhi.is_shader_valid(&vs));
    assert!(!rhi.is_shader_valid(&fs));

    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.end_frame().unwrap();
    assert_eq!(rhi.stats().draw_calls, 1);

    rhi.unbind_renderable(&renderable).unwrap();
    assert!(rhi.stats().state_caches_empty());
}

/// A vertex shader reading locations the mesh layout does not provide is
/// rejected at bind with a diagnostic, leaving nothing retained.
#[test]
fn test_layout_shader_mismatch_rejected_at_bind() {
    let mut rhi = headless();
    let positions = [[0.0f32; 3]; 3];
    let vertex_buffer =
        DeviceBuffer::from_slice(BufferKind::Vertex, &positions, BufferUsage::STATIC).unwrap();
    let layout = VertexLayout::new(vec![VertexAttribute {
        semantic: VertexSemantic::Position,
        format: VertexAttributeFormat::Float32x3,
    }])
    .unwrap();
    let mesh = Mesh::new(layout, vertex_buffer, None).unwrap();
    // TEST_SHADER's vertex stage reads locations 0 through 2.
    let mut renderable = Renderable::new(mesh, test_material(RenderState::default())).unwrap();

    let err = rhi.bind_renderable(&mut renderable).unwrap_err();
    assert!(matches!(err, RhiError::InvalidParameter(_)));
    assert!(!rhi.is_renderable_bound(&renderable));
    assert!(rhi.stats().state_caches_empty());
}

// ============================================================================
// Frame Lifecycle Tests
// ============================================================================

/// `render_mesh` binds an unbound renderable on first use.
#[test]
fn test_render_mesh_auto_binds() {
    let mut rhi = headless();
    let mut renderable = test_renderable(test_material(RenderState::default()));
    assert!(!rhi.is_renderable_bound(&renderable));

    rhi.begin_frame().unwrap();
    rhi.render_mesh(&mut renderable).unwrap();
    rhi.end_frame().unwrap();

    assert!(rhi.is_renderable_bound(&renderable));
    assert_eq!(rhi.stats().draw_calls, 1);
}

/// Everything a frame touched can be torn down afterwards, leaving the
/// backend with no live state objects.
#[test]
fn test_full_teardown_leaves_backend_clean() {
    let mut rhi = headless();
    let mut opaque = test_renderable(test_material(RenderState::default()));
    let mut textured = test_renderable(textured_material());

    for _ in 0..3 {
        rhi.begin_frame().unwrap();
        rhi.render_mesh(&mut opaque).unwrap();
        rhi.render_mesh(&mut textured).unwrap();
        rhi.end_frame().unwrap();
    }
    assert_eq!(rhi.stats().draw_calls, 6);

    rhi.unbind_renderable(&opaque).unwrap();
    rhi.unbind_renderable(&textured).unwrap();
    rhi.wait_idle().unwrap();
    assert!(rhi.stats().state_caches_empty());
}
