//! A renderable: the unit of drawing.

use std::sync::Arc;

use crate::backend::ResourceId;
use crate::error::RhiResult;
use crate::material::Material;
use crate::mesh::Mesh;

/// One mesh paired with one shared material.
///
/// The mesh is owned exclusively; the material is shared. Backend-private
/// render data (buffer handles, state-cache keys) lives in the backend's
/// arena under this renderable's id. Until the first bind the arena has no
/// entry; unbinding removes it and releases every state-cache reference it
/// acquired.
#[derive(Debug)]
pub struct Renderable {
    id: ResourceId,
    mesh: Mesh,
    material: Arc<Material>,
}

impl Renderable {
    pub fn new(mesh: Mesh, material: Arc<Material>) -> RhiResult<Self> {
        Ok(Self {
            id: ResourceId::allocate(),
            mesh,
            material,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn mesh_mut(&mut self) -> &mut Mesh {
        &mut self.mesh
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }
}

static_assertions::assert_impl_all!(Renderable: Send, Sync);
