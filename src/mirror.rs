//! Mirror engine
//!
//! Computes the tag diff between a source repository and the set already
//! recorded as mirrored, then applies the minimal copies needed. The
//! engine is deliberately pure orchestration over a [`TagSource`]: all
//! registry I/O lives behind the trait.

use std::collections::BTreeSet;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::crd::ImageMirrorSpec;
use crate::error::{Error, Result};
use crate::registry::{Repository, TagSource};

/// Result of one mirroring pass.
///
/// `mirrored_tags` is always a superset of the previously recorded set;
/// on failure it carries whatever progress was made before the error so
/// the caller can persist it and retry the remainder later.
#[derive(Debug)]
pub struct MirrorOutcome {
    pub mirrored_tags: BTreeSet<String>,
    pub error: Option<Error>,
}

impl MirrorOutcome {
    fn partial(mirrored_tags: BTreeSet<String>, error: Error) -> Self {
        Self {
            mirrored_tags,
            error: Some(error),
        }
    }

    fn complete(mirrored_tags: BTreeSet<String>) -> Self {
        Self {
            mirrored_tags,
            error: None,
        }
    }
}

/// Compile the tag-selection pattern.
///
/// Returns `None` for an empty pattern: mirroring is opt-in and a
/// missing pattern must never implicitly match everything. Matching is
/// anchored to the full tag string and case-sensitive.
pub fn compile_pattern(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!("^(?:{pattern})$"))
        .map(Some)
        .map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            source: e,
        })
}

/// Run one mirroring pass for `spec`.
///
/// The returned set is seeded from `previously_mirrored`; tags are only
/// ever added. A tag already recorded as mirrored is skipped even if it
/// still matches, so a pass over an unchanged source issues no copies.
/// Copying stops at the first failure, with the progress made so far
/// preserved in the outcome.
pub async fn mirror_tags<S: TagSource + ?Sized>(
    tag_source: &S,
    spec: &ImageMirrorSpec,
    previously_mirrored: &[String],
    source_token: &str,
    dest_token: &str,
) -> MirrorOutcome {
    let mut mirrored: BTreeSet<String> = previously_mirrored.iter().cloned().collect();

    // Pattern and repository URLs are checked before any network call.
    let regex = match compile_pattern(&spec.pattern) {
        Ok(Some(regex)) => regex,
        Ok(None) => {
            debug!(image = %spec.image_name, "Empty tag pattern selects no tags");
            return MirrorOutcome::complete(mirrored);
        }
        Err(e) => return MirrorOutcome::partial(mirrored, e),
    };

    let source_repo = match Repository::parse(&spec.source_repository) {
        Ok(repo) => repo,
        Err(e) => return MirrorOutcome::partial(mirrored, e),
    };
    let dest_repo = match Repository::parse(&spec.dest_repository) {
        Ok(repo) => repo,
        Err(e) => return MirrorOutcome::partial(mirrored, e),
    };

    let source_tags = match tag_source
        .list_tags(&source_repo, &spec.image_name, source_token)
        .await
    {
        Ok(tags) => tags,
        Err(e) => return MirrorOutcome::partial(mirrored, e),
    };

    // The diff is taken against the recorded set, not the destination's
    // tag list: the recorded set is the durable contract with the user,
    // and it keeps the engine independent of destination listability.
    let pending: Vec<&String> = source_tags
        .iter()
        .filter(|tag| regex.is_match(tag) && !mirrored.contains(*tag))
        .collect();

    if pending.is_empty() {
        debug!(
            image = %spec.image_name,
            source_tags = source_tags.len(),
            "No new tags to mirror"
        );
        return MirrorOutcome::complete(mirrored);
    }

    info!(
        image = %spec.image_name,
        count = pending.len(),
        "Mirroring tags"
    );

    for tag in pending {
        match tag_source
            .copy_tag(
                &source_repo,
                &dest_repo,
                &spec.image_name,
                tag,
                source_token,
                dest_token,
            )
            .await
        {
            Ok(()) => {
                debug!(image = %spec.image_name, %tag, "Tag mirrored");
                mirrored.insert(tag.clone());
            }
            Err(e) => {
                // Fail fast: remaining tags are picked up by the next
                // cycle, with the progress made so far kept.
                warn!(
                    image = %spec.image_name,
                    %tag,
                    error = %e,
                    "Tag copy failed, stopping this cycle"
                );
                return MirrorOutcome::partial(mirrored, e);
            }
        }
    }

    MirrorOutcome::complete(mirrored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Canned tag source recording every call it receives.
    struct FakeRegistry {
        tags: Vec<String>,
        /// Copy of this tag fails with a network-ish error.
        fail_on: Option<String>,
        /// Listing fails outright when set.
        fail_list: bool,
        list_calls: Mutex<u32>,
        copies: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        fn with_tags(tags: &[&str]) -> Self {
            Self {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                fail_on: None,
                fail_list: false,
                list_calls: Mutex::new(0),
                copies: Mutex::new(Vec::new()),
            }
        }

        fn list_calls(&self) -> u32 {
            *self.list_calls.lock().unwrap()
        }

        fn copies(&self) -> Vec<String> {
            self.copies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TagSource for FakeRegistry {
        async fn list_tags(
            &self,
            _repository: &Repository,
            _image: &str,
            _token: &str,
        ) -> Result<Vec<String>> {
            *self.list_calls.lock().unwrap() += 1;
            if self.fail_list {
                return Err(Error::TagList {
                    url: "https://registry.test/v2/app/tags/list".to_string(),
                    status: 503,
                });
            }
            Ok(self.tags.clone())
        }

        async fn copy_tag(
            &self,
            _source: &Repository,
            _dest: &Repository,
            _image: &str,
            tag: &str,
            _source_token: &str,
            _dest_token: &str,
        ) -> Result<()> {
            self.copies.lock().unwrap().push(tag.to_string());
            if self.fail_on.as_deref() == Some(tag) {
                return Err(Error::CopyFailed {
                    tag: tag.to_string(),
                    reason: "connection reset by peer".to_string(),
                });
            }
            Ok(())
        }
    }

    fn spec(pattern: &str) -> ImageMirrorSpec {
        ImageMirrorSpec {
            source_repository: "docker.io/lib/".to_string(),
            dest_repository: "mirror.example/lib/".to_string(),
            image_name: "app".to_string(),
            pattern: pattern.to_string(),
            source_secret_name: "source-creds".to_string(),
            dest_secret_name: "dest-creds".to_string(),
        }
    }

    fn tag_set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    // ── pattern compilation ────────────────────────────────────────────

    #[test]
    fn test_empty_pattern_selects_nothing() {
        assert!(compile_pattern("").unwrap().is_none());
    }

    #[test]
    fn test_pattern_is_anchored() {
        let re = compile_pattern("v1").unwrap().unwrap();
        assert!(re.is_match("v1"));
        assert!(!re.is_match("v1.0"));
        assert!(!re.is_match("xv1"));
    }

    #[test]
    fn test_pattern_is_case_sensitive() {
        let re = compile_pattern("v[0-9]+").unwrap().unwrap();
        assert!(re.is_match("v1"));
        assert!(!re.is_match("V1"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = compile_pattern("[").unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
    }

    // ── engine ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_matching_tags_are_mirrored() {
        let registry = FakeRegistry::with_tags(&["v1.0", "v1.1", "latest", "v2.0-rc1"]);
        let outcome = mirror_tags(
            &registry,
            &spec("^v[0-9]+\\.[0-9]+$"),
            &[],
            "src-tok",
            "dst-tok",
        )
        .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.mirrored_tags, tag_set(&["v1.0", "v1.1"]));
        assert_eq!(registry.copies(), vec!["v1.0", "v1.1"]);
    }

    #[tokio::test]
    async fn test_second_run_issues_no_copies() {
        let registry = FakeRegistry::with_tags(&["v1.0", "v1.1", "latest"]);
        let pattern = "^v[0-9]+\\.[0-9]+$";

        let first = mirror_tags(&registry, &spec(pattern), &[], "s", "d").await;
        assert!(first.error.is_none());

        let recorded: Vec<String> = first.mirrored_tags.iter().cloned().collect();
        let second = mirror_tags(&registry, &spec(pattern), &recorded, "s", "d").await;

        assert!(second.error.is_none());
        assert_eq!(second.mirrored_tags, first.mirrored_tags);
        // Both matching copies happened in the first run only.
        assert_eq!(registry.copies().len(), 2);
    }

    #[tokio::test]
    async fn test_copy_failure_preserves_progress() {
        let mut registry = FakeRegistry::with_tags(&["v1.0", "v1.1"]);
        registry.fail_on = Some("v1.1".to_string());

        let previously = vec!["v1.0".to_string()];
        let outcome = mirror_tags(
            &registry,
            &spec("^v[0-9]+\\.[0-9]+$"),
            &previously,
            "s",
            "d",
        )
        .await;

        assert!(outcome.error.is_some());
        // v1.1's copy failed, so the recorded set is unchanged.
        assert_eq!(outcome.mirrored_tags, tag_set(&["v1.0"]));
        assert_eq!(registry.copies(), vec!["v1.1"]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_remaining_tags() {
        let mut registry = FakeRegistry::with_tags(&["v1.0", "v1.1", "v1.2"]);
        registry.fail_on = Some("v1.1".to_string());

        let outcome = mirror_tags(&registry, &spec("^v[0-9]+\\.[0-9]+$"), &[], "s", "d").await;

        assert!(outcome.error.is_some());
        assert_eq!(outcome.mirrored_tags, tag_set(&["v1.0"]));
        // v1.2 was never attempted after v1.1 failed.
        assert_eq!(registry.copies(), vec!["v1.0", "v1.1"]);
    }

    #[tokio::test]
    async fn test_empty_pattern_skips_listing() {
        let registry = FakeRegistry::with_tags(&["v1.0"]);
        let previously = vec!["old".to_string()];
        let outcome = mirror_tags(&registry, &spec(""), &previously, "s", "d").await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.mirrored_tags, tag_set(&["old"]));
        assert_eq!(registry.list_calls(), 0);
        assert!(registry.copies().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_aborts_before_network() {
        let registry = FakeRegistry::with_tags(&["v1.0"]);
        let outcome = mirror_tags(&registry, &spec("["), &[], "s", "d").await;

        assert!(matches!(outcome.error, Some(Error::InvalidPattern { .. })));
        assert_eq!(registry.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_list_failure_keeps_recorded_set() {
        let mut registry = FakeRegistry::with_tags(&[]);
        registry.fail_list = true;

        let previously = vec!["v1.0".to_string()];
        let outcome = mirror_tags(&registry, &spec("^v.*$"), &previously, "s", "d").await;

        assert!(matches!(outcome.error, Some(Error::TagList { .. })));
        assert_eq!(outcome.mirrored_tags, tag_set(&["v1.0"]));
        assert!(registry.copies().is_empty());
    }

    #[tokio::test]
    async fn test_recorded_tags_survive_pattern_change() {
        // "old" no longer matches the pattern but stays recorded.
        let registry = FakeRegistry::with_tags(&["old", "v1.0"]);
        let previously = vec!["old".to_string()];
        let outcome = mirror_tags(
            &registry,
            &spec("^v[0-9]+\\.[0-9]+$"),
            &previously,
            "s",
            "d",
        )
        .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.mirrored_tags, tag_set(&["old", "v1.0"]));
    }

    #[tokio::test]
    async fn test_result_never_fabricates_tags() {
        let registry = FakeRegistry::with_tags(&["v1.0", "v2.0"]);
        let previously = vec!["v0.9".to_string()];
        let outcome = mirror_tags(&registry, &spec("^v[0-9]+\\.[0-9]+$"), &previously, "s", "d")
            .await;

        let known: BTreeSet<String> = registry
            .tags
            .iter()
            .cloned()
            .chain(previously.iter().cloned())
            .collect();
        assert!(outcome.mirrored_tags.is_subset(&known));
    }
}
