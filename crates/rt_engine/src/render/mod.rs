//! GPU rendering

pub mod backends;
