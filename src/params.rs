//! Shader-parameter binding.
//!
//! Each uniform buffer of a bound shader pair gets a shadow byte copy sized
//! from reflection. Writers compare against the shadow and only a real change
//! marks the buffer dirty; at draw time each dirty buffer is uploaded at most
//! once. Most draws change nothing and cost no uploads.

use glam::{Mat4, Vec2, Vec3};

use crate::shader::{ReflectedLayout, UniformBufferLayout};

/// Well-known per-draw values filled by the facade. Reflected uniform members
/// with these names are maintained automatically:
/// `u_world`, `u_view`, `u_proj`, `u_world_view`, `u_world_view_proj`,
/// `u_inv_view`, `u_camera_pos`, `u_resolution`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameParams {
    pub world: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
    pub camera_position: Vec3,
    pub resolution: Vec2,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            world: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            camera_position: Vec3::ZERO,
            resolution: Vec2::ZERO,
        }
    }
}

#[derive(Debug)]
struct ShadowBuffer {
    layout: UniformBufferLayout,
    shadow: Vec<u8>,
    dirty: bool,
    upload_count: u64,
}

/// Dirty-tracking writer for the uniform buffers of one bound shader pair.
#[derive(Debug, Default)]
pub struct ParameterBinder {
    buffers: Vec<ShadowBuffer>,
}

impl ParameterBinder {
    /// Merges the reflected layouts of both stages; buffers sharing a
    /// (group, binding) slot are carried once.
    pub fn new(layouts: &[&ReflectedLayout]) -> Self {
        let mut buffers: Vec<ShadowBuffer> = Vec::new();
        for layout in layouts {
            for buffer in &layout.uniform_buffers {
                let slot = (buffer.group, buffer.binding);
                if buffers
                    .iter()
                    .any(|b| (b.layout.group, b.layout.binding) == slot)
                {
                    continue;
                }
                buffers.push(ShadowBuffer {
                    shadow: vec![0; buffer.size_bytes as usize],
                    layout: buffer.clone(),
                    // Fresh shadows must reach the GPU once.
                    dirty: true,
                    upload_count: 0,
                });
            }
        }
        Self { buffers }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// The reflected layouts being shadowed, for backends that allocate a
    /// native buffer per slot.
    pub fn buffer_layouts(&self) -> impl Iterator<Item = &UniformBufferLayout> {
        self.buffers.iter().map(|b| &b.layout)
    }

    /// Writes `bytes` into every member named `name`, marking only actually
    /// changed buffers dirty. Returns true if any member matched.
    pub fn set_param(&mut self, name: &str, bytes: &[u8]) -> bool {
        let mut matched = false;
        for buffer in &mut self.buffers {
            let Some(member) = buffer.layout.find_member(name) else {
                continue;
            };
            matched = true;
            let offset = member.offset as usize;
            let len = bytes.len().min(member.size as usize);
            let dst = &mut buffer.shadow[offset..offset + len];
            if dst != &bytes[..len] {
                dst.copy_from_slice(&bytes[..len]);
                buffer.dirty = true;
            }
        }
        matched
    }

    /// Maintains the well-known semantic members from `frame`.
    pub fn set_frame_params(&mut self, frame: &FrameParams) {
        let world_view = frame.view * frame.world;
        let world_view_proj = frame.projection * world_view;
        let inv_view = frame.view.inverse();

        self.set_param("u_world", bytemuck::bytes_of(&frame.world));
        self.set_param("u_view", bytemuck::bytes_of(&frame.view));
        self.set_param("u_proj", bytemuck::bytes_of(&frame.projection));
        self.set_param("u_world_view", bytemuck::bytes_of(&world_view));
        self.set_param("u_world_view_proj", bytemuck::bytes_of(&world_view_proj));
        self.set_param("u_inv_view", bytemuck::bytes_of(&inv_view));
        self.set_param("u_camera_pos", bytemuck::bytes_of(&frame.camera_position));
        self.set_param("u_resolution", bytemuck::bytes_of(&frame.resolution));
    }

    /// Uploads every dirty buffer exactly once and clears the flags.
    /// Returns how many buffers were uploaded.
    pub fn flush(&mut self, mut upload: impl FnMut(&UniformBufferLayout, &[u8])) -> u32 {
        let mut uploaded = 0;
        for buffer in &mut self.buffers {
            if !buffer.dirty {
                continue;
            }
            upload(&buffer.layout, &buffer.shadow);
            buffer.dirty = false;
            buffer.upload_count += 1;
            uploaded += 1;
        }
        uploaded
    }

    /// Total uploads performed since creation, summed over all buffers.
    pub fn total_uploads(&self) -> u64 {
        self.buffers.iter().map(|b| b.upload_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{compile_shader, Shader};

    const BOUND_SHADER: &str = r#"
struct Globals {
    u_world_view_proj: mat4x4<f32>,
    u_tint: vec4<f32>,
};
@group(0) @binding(0) var<uniform> globals: Globals;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return globals.u_world_view_proj * (vec4<f32>(position, 1.0) + globals.u_tint);
}
"#;

    fn binder() -> ParameterBinder {
        let module = compile_shader(&Shader::vertex("test", BOUND_SHADER)).unwrap();
        ParameterBinder::new(&[&module.layout])
    }

    #[test]
    fn test_initial_flush_uploads_once() {
        let mut binder = binder();
        assert_eq!(binder.buffer_count(), 1);
        assert_eq!(binder.flush(|_, _| {}), 1);
        assert_eq!(binder.flush(|_, _| {}), 0);
    }

    #[test]
    fn test_unchanged_value_does_not_upload() {
        let mut binder = binder();
        binder.flush(|_, _| {});

        let tint = [1.0f32, 0.5, 0.0, 1.0];
        binder.set_param("u_tint", bytemuck::bytes_of(&tint));
        assert_eq!(binder.flush(|_, _| {}), 1);

        // Same value again: shadow comparison suppresses the upload.
        binder.set_param("u_tint", bytemuck::bytes_of(&tint));
        assert_eq!(binder.flush(|_, _| {}), 0);
        assert_eq!(binder.total_uploads(), 2);
    }

    #[test]
    fn test_two_writes_one_upload() {
        let mut binder = binder();
        binder.flush(|_, _| {});

        binder.set_param("u_tint", bytemuck::bytes_of(&[1.0f32, 0.0, 0.0, 1.0]));
        binder.set_param("u_tint", bytemuck::bytes_of(&[0.0f32, 1.0, 0.0, 1.0]));
        assert_eq!(binder.flush(|_, _| {}), 1);
    }

    #[test]
    fn test_frame_params_reach_shadow() {
        let mut binder = binder();
        binder.flush(|_, _| {});

        let frame = FrameParams {
            world: Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            ..FrameParams::default()
        };
        binder.set_frame_params(&frame);
        let mut bytes = Vec::new();
        binder.flush(|_, shadow| bytes = shadow.to_vec());
        let expected = frame.projection * frame.view * frame.world;
        assert_eq!(&bytes[..64], bytemuck::bytes_of(&expected));
    }

    #[test]
    fn test_unknown_param_is_ignored() {
        let mut binder = binder();
        binder.flush(|_, _| {});
        assert!(!binder.set_param("u_missing", &[0u8; 4]));
        assert_eq!(binder.flush(|_, _| {}), 0);
    }
}
