//! Path-keyed texture de-duplication
//!
//! Scene files reference the same texture from many materials. The cache
//! decodes each source path once and hands back the same image handle on
//! every later request. Decode failures are content errors: they are logged
//! once and yield the null handle, so the material shades with its factors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ash::vk;

use crate::render::backends::vulkan::resources::image::{Image, ImageCreation};
use crate::render::backends::vulkan::resources::resource_table::ResourceHandle;
use crate::render::backends::vulkan::VulkanResult;

/// Texture decoding errors
#[derive(thiserror::Error, Debug)]
pub enum TextureError {
    /// The file could not be opened or decoded
    #[error("Failed to decode {path}: {source}")]
    Decode {
        /// Source path
        path: String,
        /// Decoder error
        source: image::ImageError,
    },
}

/// RGBA8 pixels ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTexture {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Tightly packed RGBA8 pixels
    pub pixels: Vec<u8>,
}

impl DecodedTexture {
    /// Decode any supported file into RGBA8
    pub fn from_file(path: &Path) -> Result<Self, TextureError> {
        let decoded = image::open(path).map_err(|source| TextureError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self { width, height, pixels: rgba.into_raw() })
    }

    /// Image creation parameters for a sampled sRGB texture
    pub fn into_creation(self, name: impl Into<String>) -> ImageCreation {
        ImageCreation {
            data: self.pixels,
            width: self.width,
            height: self.height,
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::SAMPLED,
            name: name.into(),
        }
    }
}

/// Cache of decoded textures keyed by source path
#[derive(Debug, Default)]
pub struct TextureCache {
    entries: HashMap<PathBuf, ResourceHandle<Image>>,
}

impl TextureCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `path`, decoding and creating it on first use
    ///
    /// `create` registers the decoded texture (usually
    /// `BindlessResources::create_image`) and is only invoked on a cache miss
    /// with a successful decode.
    pub fn get_or_load<F>(&mut self, path: &Path, create: F) -> VulkanResult<ResourceHandle<Image>>
    where
        F: FnOnce(ImageCreation) -> VulkanResult<ResourceHandle<Image>>,
    {
        self.get_or_insert_with(path, DecodedTexture::from_file, create)
    }

    fn get_or_insert_with<D, F>(&mut self, path: &Path, decode: D, create: F) -> VulkanResult<ResourceHandle<Image>>
    where
        D: FnOnce(&Path) -> Result<DecodedTexture, TextureError>,
        F: FnOnce(ImageCreation) -> VulkanResult<ResourceHandle<Image>>,
    {
        if let Some(handle) = self.entries.get(path) {
            return Ok(*handle);
        }

        let handle = match decode(path) {
            Ok(decoded) => {
                log::debug!("[TEXTURE] Decoded {} ({}x{})", path.display(), decoded.width, decoded.height);
                create(decoded.into_creation(path.display().to_string()))?
            }
            Err(e) => {
                log::error!("[TEXTURE] {}; falling back to material factors", e);
                ResourceHandle::null()
            }
        };

        self.entries.insert(path.to_path_buf(), handle);
        Ok(handle)
    }

    /// Number of distinct paths seen
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no path has been requested yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn checkerboard(_: &Path) -> Result<DecodedTexture, TextureError> {
        Ok(DecodedTexture { width: 2, height: 1, pixels: vec![0; 8] })
    }

    #[test]
    fn test_same_path_is_created_once() {
        let mut cache = TextureCache::new();
        let created = Cell::new(0);
        let create = |creation: ImageCreation| {
            assert_eq!(creation.width, 2);
            created.set(created.get() + 1);
            Ok(ResourceHandle::new(created.get() - 1))
        };

        let first = cache.get_or_insert_with(Path::new("a.png"), checkerboard, create).unwrap();
        let second = cache.get_or_insert_with(Path::new("a.png"), checkerboard, create).unwrap();
        let other = cache.get_or_insert_with(Path::new("b.png"), checkerboard, create).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(created.get(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_decode_failure_yields_null_handle() {
        let mut cache = TextureCache::new();
        let handle = cache
            .get_or_load(Path::new("does/not/exist.png"), |_| panic!("nothing to create"))
            .unwrap();
        assert!(handle.is_null());

        // cached, so the failure is reported only once
        let again = cache.get_or_load(Path::new("does/not/exist.png"), |_| panic!("nothing to create")).unwrap();
        assert!(again.is_null());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_decoded_texture_becomes_srgb_creation() {
        let creation = checkerboard(Path::new("x")).unwrap().into_creation("x");
        assert_eq!(creation.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(creation.data.len(), 8);
        assert_eq!(creation.name, "x");
    }
}
