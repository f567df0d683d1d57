//! Hardware ray-tracing support for the Kiln toolkit.
//!
//! This crate provides:
//! - Geometry descriptors for acceleration structure builds
//! - Shader binding table layout and handle upload

pub mod geometry;
pub mod sbt;

pub use geometry::{AabbGeometry, AsInstanceGeometry, TriangleGeometry};
pub use sbt::{GeneralGroup, HitGroup, HitGroupKind, Region, SbtLayout, ShaderBindingTable};
