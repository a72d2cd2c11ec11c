//! Custom Resource Definitions for the image mirror operator.

mod image_mirror;

pub use image_mirror::{ImageMirror, ImageMirrorSpec, ImageMirrorStatus, SpecValidationError};
