//! Controller module for ImageMirror reconciliation
//!
//! Contains the controller loop, credential resolution, and status
//! persistence for mirror resources.

pub mod credentials;
mod reconciler;

pub use reconciler::{run_controller, ControllerState, FIELD_MANAGER};
