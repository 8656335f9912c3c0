//! Texture descriptions.
//!
//! A [`Texture`] either carries host pixels (uploaded at first bind) or is a
//! bare GPU store used as a render-target attachment.

use crate::backend::ResourceId;
use crate::error::{RhiError, RhiResult};
use crate::types::{TextureFormat, TextureUsage};

#[derive(Debug)]
pub struct Texture {
    id: ResourceId,
    width: u32,
    height: u32,
    format: TextureFormat,
    mip_level_count: u32,
    usage: TextureUsage,
    pixels: Option<Vec<u8>>,
}

impl Texture {
    /// A sampled texture with host pixels for mip level 0.
    ///
    /// Additional mip levels, if requested, are generated by the backend.
    pub fn with_pixels(
        width: u32,
        height: u32,
        format: TextureFormat,
        pixels: Vec<u8>,
    ) -> RhiResult<Self> {
        if width == 0 || height == 0 {
            return Err(RhiError::InvalidParameter(
                "texture extent must be non-zero".to_string(),
            ));
        }
        if format.is_depth() {
            return Err(RhiError::InvalidParameter(
                "depth formats cannot carry host pixels".to_string(),
            ));
        }
        let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
        if pixels.len() != expected {
            return Err(RhiError::InvalidParameter(format!(
                "pixel data is {} bytes, {}x{} {:?} needs {}",
                pixels.len(),
                width,
                height,
                format,
                expected
            )));
        }
        Ok(Self {
            id: ResourceId::allocate(),
            width,
            height,
            format,
            mip_level_count: 1,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            pixels: Some(pixels),
        })
    }

    /// A GPU-only store for use as a color or depth attachment.
    pub fn render_attachment(width: u32, height: u32, format: TextureFormat) -> RhiResult<Self> {
        if width == 0 || height == 0 {
            return Err(RhiError::InvalidParameter(
                "texture extent must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            id: ResourceId::allocate(),
            width,
            height,
            format,
            mip_level_count: 1,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::SAMPLED,
            pixels: None,
        })
    }

    /// A 1x1 solid-color texture, handy as a default material slot.
    pub fn solid_color(rgba: [u8; 4]) -> RhiResult<Self> {
        Self::with_pixels(1, 1, TextureFormat::Rgba8Unorm, rgba.to_vec())
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    /// Host pixels for mip level 0, if this texture carries any.
    pub fn pixels(&self) -> Option<&[u8]> {
        self.pixels.as_deref()
    }
}

static_assertions::assert_impl_all!(Texture: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_size_validation() {
        let result = Texture::with_pixels(2, 2, TextureFormat::Rgba8Unorm, vec![0; 15]);
        assert!(matches!(result, Err(RhiError::InvalidParameter(_))));
        assert!(Texture::with_pixels(2, 2, TextureFormat::Rgba8Unorm, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_depth_attachment_has_no_pixels() {
        let texture = Texture::render_attachment(256, 256, TextureFormat::Depth32Float).unwrap();
        assert!(texture.pixels().is_none());
        assert!(texture.usage().contains(TextureUsage::RENDER_ATTACHMENT));
    }

    #[test]
    fn test_depth_with_pixels_rejected() {
        let result = Texture::with_pixels(2, 2, TextureFormat::Depth32Float, vec![0; 16]);
        assert!(matches!(result, Err(RhiError::InvalidParameter(_))));
    }
}
