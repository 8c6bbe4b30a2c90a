//! PBR materials as seen by the closest-hit shader
//!
//! A [`MaterialCreation`] describes a material on the CPU side with optional
//! texture handles. It is flattened once into a [`Material`], the std430
//! record stored in the bindless materials buffer. Absent textures keep the
//! null index and clear their `use` flag so shaders fall back to the factors.

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{Vec3, Vec4};
use crate::render::backends::vulkan::resources::image::Image;
use crate::render::backends::vulkan::resources::resource_table::ResourceHandle;

/// CPU-side material description
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialCreation {
    /// Base color multiplier (RGBA)
    pub albedo_factor: Vec4,
    /// Base color texture
    pub albedo_map: ResourceHandle<Image>,
    /// UV set used by the base color texture
    pub albedo_uv_channel: u32,

    /// Metalness multiplier
    pub metallic_factor: f32,
    /// Roughness multiplier
    pub roughness_factor: f32,
    /// Metallic (B) / roughness (G) texture
    pub metallic_roughness_map: ResourceHandle<Image>,
    /// UV set used by the metallic-roughness texture
    pub metallic_roughness_uv_channel: u32,

    /// Tangent-space normal texture
    pub normal_map: ResourceHandle<Image>,
    /// Normal perturbation scale
    pub normal_scale: f32,
    /// UV set used by the normal texture
    pub normal_uv_channel: u32,

    /// Ambient occlusion texture
    pub occlusion_map: ResourceHandle<Image>,
    /// Occlusion strength
    pub occlusion_strength: f32,
    /// UV set used by the occlusion texture
    pub occlusion_uv_channel: u32,

    /// Emitted radiance multiplier (RGB)
    pub emissive_factor: Vec3,
    /// Emission texture
    pub emissive_map: ResourceHandle<Image>,
    /// UV set used by the emission texture
    pub emissive_uv_channel: u32,
}

impl Default for MaterialCreation {
    fn default() -> Self {
        Self {
            albedo_factor: Vec4::new(1.0, 1.0, 1.0, 1.0),
            albedo_map: ResourceHandle::null(),
            albedo_uv_channel: 0,
            metallic_factor: 1.0,
            roughness_factor: 1.0,
            metallic_roughness_map: ResourceHandle::null(),
            metallic_roughness_uv_channel: 0,
            normal_map: ResourceHandle::null(),
            normal_scale: 1.0,
            normal_uv_channel: 0,
            occlusion_map: ResourceHandle::null(),
            occlusion_strength: 1.0,
            occlusion_uv_channel: 0,
            emissive_factor: Vec3::zeros(),
            emissive_map: ResourceHandle::null(),
            emissive_uv_channel: 0,
        }
    }
}

/// GPU material record (std430, 112 bytes)
///
/// Must match the `Material` struct declared by the closest-hit shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Material {
    /// Base color multiplier
    pub albedo_factor: [f32; 4],
    /// Metallic, roughness, normal scale, occlusion strength
    pub metallic_roughness_normal_occlusion: [f32; 4],
    /// Emissive RGB, w unused
    pub emissive_factor: [f32; 4],
    /// Map-present flags: albedo, metallic-roughness, normal, occlusion
    pub map_flags: [u32; 4],
    /// Bindless image indices: albedo, metallic-roughness, normal, occlusion
    pub map_indices: [u32; 4],
    /// UV sets: albedo, metallic-roughness, normal, occlusion
    pub uv_channels: [u32; 4],
    /// Emissive map flag, index, UV set; w unused
    pub emissive_map: [u32; 4],
}

fn map_flag(handle: ResourceHandle<Image>) -> u32 {
    u32::from(!handle.is_null())
}

impl From<&MaterialCreation> for Material {
    fn from(creation: &MaterialCreation) -> Self {
        let a = creation.albedo_factor;
        let e = creation.emissive_factor;
        Self {
            albedo_factor: [a.x, a.y, a.z, a.w],
            metallic_roughness_normal_occlusion: [
                creation.metallic_factor,
                creation.roughness_factor,
                creation.normal_scale,
                creation.occlusion_strength,
            ],
            emissive_factor: [e.x, e.y, e.z, 0.0],
            map_flags: [
                map_flag(creation.albedo_map),
                map_flag(creation.metallic_roughness_map),
                map_flag(creation.normal_map),
                map_flag(creation.occlusion_map),
            ],
            map_indices: [
                creation.albedo_map.index(),
                creation.metallic_roughness_map.index(),
                creation.normal_map.index(),
                creation.occlusion_map.index(),
            ],
            uv_channels: [
                creation.albedo_uv_channel,
                creation.metallic_roughness_uv_channel,
                creation.normal_uv_channel,
                creation.occlusion_uv_channel,
            ],
            emissive_map: [
                map_flag(creation.emissive_map),
                creation.emissive_map.index(),
                creation.emissive_uv_channel,
                0,
            ],
        }
    }
}

impl Material {
    /// Whether the base color texture is sampled
    pub fn uses_albedo_map(&self) -> bool {
        self.map_flags[0] != 0
    }

    /// Whether the emission texture is sampled
    pub fn uses_emissive_map(&self) -> bool {
        self.emissive_map[0] != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::vulkan::resources::resource_table::{ResourceTable, NULL_RESOURCE_INDEX};

    #[test]
    fn test_gpu_layout_size() {
        assert_eq!(std::mem::size_of::<Material>(), 112);
        assert_eq!(std::mem::size_of::<Material>() % 16, 0);
    }

    #[test]
    fn test_absent_maps_clear_flags() {
        let material = Material::from(&MaterialCreation::default());
        assert_eq!(material.map_flags, [0; 4]);
        assert_eq!(material.map_indices, [NULL_RESOURCE_INDEX; 4]);
        assert!(!material.uses_albedo_map());
        assert!(!material.uses_emissive_map());
    }

    #[test]
    fn test_present_maps_resolve_indices() {
        let creation = MaterialCreation {
            albedo_map: ResourceHandle::new(3),
            normal_map: ResourceHandle::new(7),
            normal_uv_channel: 1,
            emissive_map: ResourceHandle::new(2),
            ..Default::default()
        };
        let material = Material::from(&creation);

        assert_eq!(material.map_flags, [1, 0, 1, 0]);
        assert_eq!(material.map_indices[0], 3);
        assert_eq!(material.map_indices[2], 7);
        assert_eq!(material.uv_channels[2], 1);
        assert_eq!(material.emissive_map, [1, 2, 0, 0]);
    }

    #[test]
    fn test_factors_are_packed() {
        let creation = MaterialCreation {
            albedo_factor: Vec4::new(0.5, 0.25, 0.125, 1.0),
            metallic_factor: 0.2,
            roughness_factor: 0.8,
            normal_scale: 0.5,
            occlusion_strength: 0.9,
            emissive_factor: Vec3::new(1.0, 2.0, 3.0),
            ..Default::default()
        };
        let material = Material::from(&creation);

        assert_eq!(material.albedo_factor, [0.5, 0.25, 0.125, 1.0]);
        assert_eq!(material.metallic_roughness_normal_occlusion, [0.2, 0.8, 0.5, 0.9]);
        assert_eq!(material.emissive_factor, [1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_table_round_trip_is_bit_equal() {
        let creation = MaterialCreation {
            albedo_map: ResourceHandle::new(1),
            roughness_factor: 0.3,
            ..Default::default()
        };
        let material = Material::from(&creation);

        let mut table = ResourceTable::new();
        let handle = table.create(material);
        let stored = table.get(handle).unwrap();

        assert_eq!(bytemuck::bytes_of(stored), bytemuck::bytes_of(&material));
    }
}
