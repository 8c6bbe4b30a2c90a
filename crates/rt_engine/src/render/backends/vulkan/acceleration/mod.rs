//! Two-level acceleration structures
//!
//! One bottom-level structure per model holds its triangles; one top-level
//! structure instances every bottom-level structure. Both levels share
//! [`structure::AccelerationStructure`] for the size query, allocation and
//! single-time build.

pub mod bottom_level;
pub mod structure;
pub mod top_level;
