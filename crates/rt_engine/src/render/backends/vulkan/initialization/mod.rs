//! Device context shared by every GPU resource

pub mod context;
