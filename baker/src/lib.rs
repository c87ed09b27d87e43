// This file makes `baker` into a rust library crate.

// The file `main.rs` still exists to make `baker` into an executable.

pub mod camera;
pub mod dataset;
pub mod import_obj;
pub mod mesh;
pub mod misc;
pub mod raycaster;
pub mod texture;
pub mod texture_mesh;

pub use base;
