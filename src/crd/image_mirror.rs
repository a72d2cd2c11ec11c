//! ImageMirror Custom Resource Definition
//!
//! An ImageMirror declares one mirroring intent: pull tags matching a
//! regex from a source repository and push them to a destination
//! repository, recording progress in the status subresource.
//!
//! Field names under spec and status (`source_repository`, `dest_repository`,
//! `image_name`, `tag_regex`, `mirrored_tags`) are wire-visible and must
//! stay stable across versions.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Structured validation error for `ImageMirrorSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mirror.dev",
    version = "v1alpha1",
    kind = "ImageMirror",
    namespaced,
    status = "ImageMirrorStatus",
    shortname = "im",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image_name"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.source_repository"}"#,
    printcolumn = r#"{"name":"Dest","type":"string","jsonPath":".spec.dest_repository"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ImageMirrorSpec {
    /// Source repository URL: scheme (optional), registry host, and
    /// organization (e.g. docker.io/library/). Must not include the
    /// image name or a tag.
    pub source_repository: String,

    /// Destination repository URL, same shape as `source_repository`,
    /// that mirrored images are pushed to.
    pub dest_repository: String,

    /// Image name without tag (e.g. cuda).
    pub image_name: String,

    /// Regex selecting which tags to mirror. Matching is anchored and
    /// case-sensitive. An empty or omitted pattern selects no tags:
    /// mirroring is strictly opt-in.
    #[serde(default, rename = "tag_regex")]
    pub pattern: String,

    /// Name of the Secret in this namespace holding the source registry
    /// bearer token (base64-encoded under the `token` key).
    pub source_secret_name: String,

    /// Name of the Secret in this namespace holding the destination
    /// registry bearer token.
    pub dest_secret_name: String,
}

/// Observed state of an ImageMirror.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ImageMirrorStatus {
    /// Tags that have already been mirrored to the destination. Only
    /// ever grows; a tag stays recorded even if the pattern later stops
    /// matching it.
    #[serde(default)]
    pub mirrored_tags: Vec<String>,
}

impl ImageMirrorSpec {
    /// Validate that the required fields are present.
    ///
    /// Pattern compilation is deliberately not checked here; the mirror
    /// engine reports `InvalidPattern` with the compile error attached.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        for (field, value) in [
            ("spec.source_repository", &self.source_repository),
            ("spec.dest_repository", &self.dest_repository),
            ("spec.image_name", &self.image_name),
            ("spec.source_secret_name", &self.source_secret_name),
            ("spec.dest_secret_name", &self.dest_secret_name),
        ] {
            if value.trim().is_empty() {
                errors.push(SpecValidationError::new(field, "must not be empty"));
            }
        }

        if self.image_name.contains(':') {
            errors.push(SpecValidationError::new(
                "spec.image_name",
                "must not include a tag",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
