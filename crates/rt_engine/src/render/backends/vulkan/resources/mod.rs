//! GPU resources: memory, tables and descriptors

pub mod bindless;
pub mod buffer;
pub mod descriptor_set;
pub mod geometry_node;
pub mod image;
pub mod material;
pub mod resource_table;
pub mod texture_cache;
