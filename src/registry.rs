//! Registry tag source
//!
//! Abstraction over "list all tags for an image" and "copy one tag from
//! source to destination", backed by the Docker Registry v2 HTTP API.
//! The mirror engine depends only on the [`TagSource`] trait so tests can
//! substitute a canned double.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Default per-request timeout for registry calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Manifest media types accepted when fetching a tag for copying.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A parsed repository location: registry base URL plus organization path.
///
/// Repository strings carry scheme (optional, defaults to https), host,
/// and organization, but never an image name or tag, e.g.
/// `docker.io/library/` or `https://mirror.example/team/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repository {
    base: String,
    org: String,
}

impl Repository {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(Error::ConfigError(
                "repository URL must not be empty".to_string(),
            ));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("https", trimmed),
        };

        let (host, org) = match rest.split_once('/') {
            Some((host, org)) => (host, org),
            None => (rest, ""),
        };

        if host.is_empty() {
            return Err(Error::ConfigError(format!(
                "repository URL {raw:?} has no registry host"
            )));
        }

        Ok(Self {
            base: format!("{scheme}://{host}"),
            org: org.trim_matches('/').to_string(),
        })
    }

    /// Registry-relative image path, e.g. `library/app`.
    fn image_path(&self, image: &str) -> String {
        if self.org.is_empty() {
            image.to_string()
        } else {
            format!("{}/{}", self.org, image)
        }
    }

    fn tags_url(&self, image: &str) -> String {
        format!("{}/v2/{}/tags/list", self.base, self.image_path(image))
    }

    fn manifest_url(&self, image: &str, tag: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base,
            self.image_path(image),
            tag
        )
    }
}

/// Operations the mirror engine needs from a registry.
#[async_trait]
pub trait TagSource: Send + Sync {
    /// List all tags for `image` in `repository`.
    async fn list_tags(
        &self,
        repository: &Repository,
        image: &str,
        token: &str,
    ) -> Result<Vec<String>>;

    /// Copy one tag from `source` to `dest`.
    ///
    /// Must be safe to re-invoke for a tag already present at the
    /// destination; a cancelled or crashed copy is resolved by simply
    /// attempting it again on the next cycle.
    async fn copy_tag(
        &self,
        source: &Repository,
        dest: &Repository,
        image: &str,
        tag: &str,
        source_token: &str,
        dest_token: &str,
    ) -> Result<()>;
}

/// Tag list response from `GET /v2/<name>/tags/list`.
/// Registries return `"tags": null` for repositories with no tags.
#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Registry v2 client backed by reqwest.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .user_agent(concat!(
                "image-mirror-operator/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self { http })
    }

    fn get(&self, url: &str, token: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        // Empty token means anonymous access; skip the header entirely.
        if token.is_empty() {
            req
        } else {
            req.bearer_auth(token)
        }
    }
}

#[async_trait]
impl TagSource for RegistryClient {
    async fn list_tags(
        &self,
        repository: &Repository,
        image: &str,
        token: &str,
    ) -> Result<Vec<String>> {
        let url = repository.tags_url(image);
        debug!("Listing tags: {}", url);

        let resp = self
            .get(&url, token)
            .send()
            .await
            .map_err(Error::HttpError)?;

        match resp.status() {
            status if status.is_success() => {
                let body: TagListResponse = resp.json().await.map_err(Error::HttpError)?;
                Ok(body.tags.unwrap_or_default())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::RegistryAuth {
                url,
                status: resp.status().as_u16(),
            }),
            StatusCode::NOT_FOUND => Err(Error::RepositoryNotFound { url }),
            status => Err(Error::TagList {
                url,
                status: status.as_u16(),
            }),
        }
    }

    async fn copy_tag(
        &self,
        source: &Repository,
        dest: &Repository,
        image: &str,
        tag: &str,
        source_token: &str,
        dest_token: &str,
    ) -> Result<()> {
        let src_url = source.manifest_url(image, tag);
        debug!("Fetching manifest: {}", src_url);

        let resp = self
            .get(&src_url, source_token)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(Error::HttpError)?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::RegistryAuth {
                    url: src_url,
                    status: resp.status().as_u16(),
                });
            }
            status => {
                return Err(Error::CopyFailed {
                    tag: tag.to_string(),
                    reason: format!("source returned HTTP {status} for {src_url}"),
                });
            }
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_MANIFEST_TYPE)
            .to_string();
        let manifest = resp.bytes().await.map_err(Error::HttpError)?;

        // Copy by reference: re-push the manifest verbatim under the same
        // tag. Pushing an identical manifest is an idempotent overwrite,
        // so re-running a partially completed cycle is safe.
        let dst_url = dest.manifest_url(image, tag);
        debug!("Pushing manifest: {}", dst_url);

        let mut put = self
            .http
            .put(&dst_url)
            .header(CONTENT_TYPE, content_type)
            .body(manifest);
        if !dest_token.is_empty() {
            put = put.bearer_auth(dest_token);
        }
        let resp = put.send().await.map_err(Error::HttpError)?;

        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::RegistryAuth {
                url: dst_url,
                status: resp.status().as_u16(),
            }),
            status => Err(Error::CopyFailed {
                tag: tag.to_string(),
                reason: format!("destination returned HTTP {status} for {dst_url}"),
            }),
        }
    }
}
