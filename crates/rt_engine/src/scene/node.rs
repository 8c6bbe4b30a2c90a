//! Node hierarchy with index-based parent links
//!
//! Nodes live in one arena and refer to their parent by [`NodeIndex`]. The
//! world transform of a node is its local transform with every ancestor's
//! local transform premultiplied, root first.

use thiserror::Error;

use crate::foundation::math::{Mat4, Transform};

/// Index of a node in its [`SceneGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(u32);

impl NodeIndex {
    /// Position in the arena
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Scene graph errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SceneError {
    /// Index does not refer to a node of this graph
    #[error("Node index {0} is out of range")]
    InvalidNode(u32),

    /// Assigning the parent would create a cycle
    #[error("Making node {parent} the parent of node {child} creates a cycle")]
    Cycle {
        /// Node being re-parented
        child: u32,
        /// Requested parent
        parent: u32,
    },
}

/// One scene node
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Name from the scene file, for diagnostics
    pub name: String,
    /// Transform relative to the parent
    pub local: Mat4,
    /// Parent node, `None` for roots
    pub parent: Option<NodeIndex>,
    /// Indices into the owning model's mesh list
    pub meshes: Vec<usize>,
}

impl Node {
    /// Root-less node with the given local transform and no meshes
    pub fn new(name: impl Into<String>, local: Mat4) -> Self {
        Self {
            name: name.into(),
            local,
            parent: None,
            meshes: Vec::new(),
        }
    }

    /// Node built from a TRS transform
    pub fn from_transform(name: impl Into<String>, transform: &Transform) -> Self {
        Self::new(name, transform.to_matrix())
    }

    /// Attach meshes to the node
    pub fn with_meshes(mut self, meshes: Vec<usize>) -> Self {
        self.meshes = meshes;
        self
    }
}

/// Arena of nodes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneGraph {
    nodes: Vec<Node>,
}

impl SceneGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node; its `parent` must already exist in the graph
    pub fn add_node(&mut self, node: Node) -> Result<NodeIndex, SceneError> {
        if let Some(parent) = node.parent {
            self.check(parent)?;
        }
        let index = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(node);
        Ok(index)
    }

    /// Append a node under `parent`
    pub fn add_child(&mut self, parent: NodeIndex, mut node: Node) -> Result<NodeIndex, SceneError> {
        node.parent = Some(parent);
        self.add_node(node)
    }

    /// Re-parent `child`, rejecting cycles
    pub fn set_parent(&mut self, child: NodeIndex, parent: Option<NodeIndex>) -> Result<(), SceneError> {
        self.check(child)?;
        if let Some(parent) = parent {
            self.check(parent)?;
            let mut ancestor = Some(parent);
            while let Some(current) = ancestor {
                if current == child {
                    return Err(SceneError::Cycle { child: child.0, parent: parent.0 });
                }
                ancestor = self.nodes[current.index()].parent;
            }
        }
        self.nodes[child.index()].parent = parent;
        Ok(())
    }

    /// Node by index
    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.index())
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over `(index, node)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        (0u32..).zip(self.nodes.iter()).map(|(index, node)| (NodeIndex(index), node))
    }

    /// World transform: ancestors' locals premultiplied onto the node's local
    pub fn world_matrix(&self, index: NodeIndex) -> Result<Mat4, SceneError> {
        let node = self.check(index)?;
        let mut matrix = node.local;
        let mut parent = node.parent;
        while let Some(current) = parent {
            let ancestor = self.check(current)?;
            matrix = ancestor.local * matrix;
            parent = ancestor.parent;
        }
        Ok(matrix)
    }

    fn check(&self, index: NodeIndex) -> Result<&Node, SceneError> {
        self.nodes.get(index.index()).ok_or(SceneError::InvalidNode(index.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Point3, Vec3};
    use approx::assert_relative_eq;

    fn chain() -> (SceneGraph, [NodeIndex; 3], [Mat4; 3]) {
        let a = Mat4::new_translation(&Vec3::new(1.0, 0.0, 0.0));
        let b = Mat4::new_rotation(Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2));
        let c = Mat4::new_scaling(2.0);

        let mut graph = SceneGraph::new();
        let ia = graph.add_node(Node::new("a", a)).unwrap();
        let ib = graph.add_child(ia, Node::new("b", b)).unwrap();
        let ic = graph.add_child(ib, Node::new("c", c)).unwrap();
        (graph, [ia, ib, ic], [a, b, c])
    }

    #[test]
    fn test_world_matrix_premultiplies_ancestors() {
        let (graph, [_, _, ic], [a, b, c]) = chain();
        assert_relative_eq!(graph.world_matrix(ic).unwrap(), a * b * c, epsilon = 1e-6);
    }

    #[test]
    fn test_world_matrix_transforms_point_through_chain() {
        let (graph, [_, _, ic], _) = chain();
        let point = graph.world_matrix(ic).unwrap().transform_point(&Point3::new(1.0, 0.0, 0.0));
        // scale to (2,0,0), rotate to (0,2,0), translate to (1,2,0)
        assert_relative_eq!(point, Point3::new(1.0, 2.0, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn test_root_world_matrix_is_local() {
        let (graph, [ia, _, _], [a, _, _]) = chain();
        assert_relative_eq!(graph.world_matrix(ia).unwrap(), a);
    }

    #[test]
    fn test_cycles_are_rejected() {
        let (mut graph, [ia, _, ic], _) = chain();
        assert_eq!(
            graph.set_parent(ia, Some(ic)),
            Err(SceneError::Cycle { child: 0, parent: 2 })
        );
        assert_eq!(graph.set_parent(ia, Some(ia)), Err(SceneError::Cycle { child: 0, parent: 0 }));
        assert!(graph.node(ia).unwrap().parent.is_none());
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let mut graph = SceneGraph::new();
        let mut node = Node::new("orphan", Mat4::identity());
        node.parent = Some(NodeIndex(4));
        assert_eq!(graph.add_node(node), Err(SceneError::InvalidNode(4)));
        assert!(graph.is_empty());
    }
}
