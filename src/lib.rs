//! Image Mirror Operator: Kubernetes operator for mirroring container
//! image tags between registries.
//!
//! An `ImageMirror` resource declares a source repository, a destination
//! repository, an image name, and a regex selecting which tags to
//! mirror. The operator continuously drives the destination toward that
//! desired state and records mirrored tags in the resource status.

pub mod controller;
pub mod crd;
pub mod error;
pub mod mirror;
pub mod registry;

pub use crate::error::{Error, Result};
