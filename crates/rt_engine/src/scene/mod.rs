//! Parsed scene data: node hierarchy and models

pub mod model;
pub mod node;

pub use model::{resolve_primitive_material, Mesh, Model, ModelData, Vertex};
pub use node::{Node, NodeIndex, SceneError, SceneGraph};
