//! Render targets and views.

use std::sync::Arc;

use crate::backend::ResourceId;
use crate::error::{RhiError, RhiResult};
use crate::texture::Texture;
use crate::types::{TextureUsage, Viewport};

/// An offscreen render target: color attachments plus an optional
/// depth-stencil attachment. The backing textures are bound lazily when the
/// target is first used and unbound when the target is unbound.
#[derive(Debug)]
pub struct RenderTarget {
    id: ResourceId,
    color_attachments: Vec<Arc<Texture>>,
    depth_attachment: Option<Arc<Texture>>,
    width: u32,
    height: u32,
}

impl RenderTarget {
    pub fn new(
        color_attachments: Vec<Arc<Texture>>,
        depth_attachment: Option<Arc<Texture>>,
    ) -> RhiResult<Self> {
        let first = color_attachments
            .first()
            .or(depth_attachment.as_ref())
            .ok_or_else(|| {
                RhiError::InvalidParameter(
                    "render target needs at least one attachment".to_string(),
                )
            })?;
        let (width, height) = (first.width(), first.height());

        for texture in color_attachments.iter().chain(depth_attachment.iter()) {
            if !texture.usage().contains(TextureUsage::RENDER_ATTACHMENT) {
                return Err(RhiError::InvalidParameter(format!(
                    "texture {:?} was not created as a render attachment",
                    texture.id()
                )));
            }
            if (texture.width(), texture.height()) != (width, height) {
                return Err(RhiError::InvalidParameter(
                    "render target attachments must share one extent".to_string(),
                ));
            }
        }
        for color in &color_attachments {
            if color.format().is_depth() {
                return Err(RhiError::InvalidParameter(
                    "depth formats cannot be color attachments".to_string(),
                ));
            }
        }
        if let Some(depth) = &depth_attachment {
            if !depth.format().is_depth() {
                return Err(RhiError::InvalidParameter(
                    "depth attachment must use a depth format".to_string(),
                ));
            }
        }

        Ok(Self {
            id: ResourceId::allocate(),
            color_attachments,
            depth_attachment,
            width,
            height,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn color_attachments(&self) -> &[Arc<Texture>] {
        &self.color_attachments
    }

    pub fn depth_attachment(&self) -> Option<&Arc<Texture>> {
        self.depth_attachment.as_ref()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// A view: a render target (or the swapchain, when `target` is None) plus a
/// viewport and the pass slot draws routed through it land in.
#[derive(Debug)]
pub struct View {
    target: Option<Arc<RenderTarget>>,
    viewport: Viewport,
    slot: u32,
}

impl View {
    /// A view onto an offscreen target covering its full extent.
    pub fn of_target(target: Arc<RenderTarget>, slot: u32) -> Self {
        let viewport = Viewport::from_extent(target.width(), target.height());
        Self {
            target: Some(target),
            viewport,
            slot,
        }
    }

    /// A view onto the swapchain.
    pub fn of_surface(width: u32, height: u32, slot: u32) -> Self {
        Self {
            target: None,
            viewport: Viewport::from_extent(width, height),
            slot,
        }
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn target(&self) -> Option<&Arc<RenderTarget>> {
        self.target.as_ref()
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

static_assertions::assert_impl_all!(RenderTarget: Send, Sync);
static_assertions::assert_impl_all!(View: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextureFormat;

    #[test]
    fn test_target_requires_attachment() {
        assert!(matches!(
            RenderTarget::new(vec![], None),
            Err(RhiError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_extent_mismatch_rejected() {
        let a = Arc::new(Texture::render_attachment(64, 64, TextureFormat::Rgba8Unorm).unwrap());
        let b = Arc::new(Texture::render_attachment(32, 32, TextureFormat::Rgba8Unorm).unwrap());
        assert!(RenderTarget::new(vec![a, b], None).is_err());
    }

    #[test]
    fn test_depth_as_color_rejected() {
        let depth =
            Arc::new(Texture::render_attachment(64, 64, TextureFormat::Depth32Float).unwrap());
        assert!(RenderTarget::new(vec![depth], None).is_err());
    }

    #[test]
    fn test_view_viewport_defaults_to_target_extent() {
        let color =
            Arc::new(Texture::render_attachment(128, 64, TextureFormat::Rgba8Unorm).unwrap());
        let target = Arc::new(RenderTarget::new(vec![color], None).unwrap());
        let view = View::of_target(target, 0);
        assert_eq!(view.viewport().width, 128.0);
        assert_eq!(view.viewport().height, 64.0);
    }
}
