//! # Renderer Configuration
//!
//! Settings consumed by the ray-tracing renderer: frames in flight, bindless
//! table capacity, SPIR-V shader locations and the fixed camera used to build
//! the per-frame camera uniform.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::Config;
use crate::render::backends::vulkan::state::frame_pipeline::MAX_FRAMES_IN_FLIGHT;
use crate::render::backends::vulkan::resources::bindless::DEFAULT_BINDLESS_CAPACITY;

/// Paths of the three precompiled ray-tracing shader stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RayTracingShaderConfig {
    /// Ray generation shader SPIR-V file
    pub raygen_path: String,
    /// Miss shader SPIR-V file
    pub miss_path: String,
    /// Closest-hit shader SPIR-V file
    pub closest_hit_path: String,
}

impl Default for RayTracingShaderConfig {
    fn default() -> Self {
        Self {
            raygen_path: "shaders/raygen.rgen.spv".to_string(),
            miss_path: "shaders/miss.rmiss.spv".to_string(),
            closest_hit_path: "shaders/closesthit.rchit.spv".to_string(),
        }
    }
}

impl RayTracingShaderConfig {
    /// Create shader config with automatic path resolution
    ///
    /// Each file name is looked up in a few common shader directories so the
    /// host application can be started from different working directories.
    /// Names that are not found anywhere are kept as given.
    pub fn with_path_resolution(raygen: &str, miss: &str, closest_hit: &str) -> Self {
        const SHADER_DIRS: [&str; 4] = ["target/shaders/", "shaders/", "resources/shaders/", "../shaders/"];

        let resolve = |name: &str| {
            SHADER_DIRS
                .iter()
                .map(|dir| format!("{dir}{name}"))
                .find(|candidate| Path::new(candidate).exists())
                .unwrap_or_else(|| name.to_string())
        };

        Self {
            raygen_path: resolve(raygen),
            miss_path: resolve(miss),
            closest_hit_path: resolve(closest_hit),
        }
    }
}

/// Fixed viewpoint used for the camera uniform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Eye position in world space
    pub position: [f32; 3],
    /// Point the camera looks at
    pub target: [f32; 3],
    /// Up direction
    pub up: [f32; 3],
    /// Vertical field of view in degrees
    pub fov_y_degrees: f32,
    /// Near clip distance
    pub near: f32,
    /// Far clip distance
    pub far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 2.5],
            target: [0.0, 0.0, 0.0],
            up: [0.0, 1.0, 0.0],
            fov_y_degrees: 60.0,
            near: 0.1,
            far: 512.0,
        }
    }
}

/// Top-level renderer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frame slots cycled by the frame pipeline
    pub frames_in_flight: usize,
    /// Maximum number of entries per bindless resource kind
    pub bindless_capacity: u32,
    /// Attach debug-utils names to created GPU objects
    pub enable_debug_names: bool,
    /// Ray-tracing shader locations
    pub shaders: RayTracingShaderConfig,
    /// Camera parameters
    pub camera: CameraConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            bindless_capacity: DEFAULT_BINDLESS_CAPACITY,
            enable_debug_names: cfg!(debug_assertions),
            shaders: RayTracingShaderConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.bindless_capacity, 1024);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let text = r#"
            frames_in_flight = 2

            [camera]
            fov_y_degrees = 45.0
        "#;

        let config = RendererConfig::from_str_with_format(text, "renderer.toml").unwrap();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.bindless_capacity, DEFAULT_BINDLESS_CAPACITY);
        assert_eq!(config.camera.fov_y_degrees, 45.0);
        assert_eq!(config.camera.position, CameraConfig::default().position);
        assert_eq!(config.shaders, RayTracingShaderConfig::default());
    }

    #[test]
    fn test_ron_config_is_parsed() {
        let text = "(bindless_capacity: 256, enable_debug_names: false)";
        let config = RendererConfig::from_str_with_format(text, "renderer.ron").unwrap();
        assert_eq!(config.bindless_capacity, 256);
        assert!(!config.enable_debug_names);
    }

    #[test]
    fn test_debug_names_default_follows_build_profile() {
        assert_eq!(RendererConfig::default().enable_debug_names, cfg!(debug_assertions));

        let config = RendererConfig::from_str_with_format("enable_debug_names = true", "renderer.toml").unwrap();
        assert!(config.enable_debug_names);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let result = RendererConfig::from_str_with_format("", "renderer.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_unresolved_shader_names_are_kept() {
        let shaders = RayTracingShaderConfig::with_path_resolution("a.spv", "b.spv", "c.spv");
        assert_eq!(shaders.raygen_path, "a.spv");
        assert_eq!(shaders.miss_path, "b.spv");
        assert_eq!(shaders.closest_hit_path, "c.spv");
    }
}
