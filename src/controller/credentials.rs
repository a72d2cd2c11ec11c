//! Registry credential resolution
//!
//! Tokens live in namespace-local Secrets under a `token` key whose
//! value is itself base64-encoded. They are resolved fresh on every
//! reconcile cycle and never cached, so a rotated secret takes effect
//! on the next cycle without operator restarts.
//!
//! The token value is never logged; messages reference secret names only.

use async_trait::async_trait;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use kube::{api::Api, Client};
use tracing::debug;

use crate::error::{Error, Result};

/// Key within the Secret data holding the encoded bearer token.
pub const TOKEN_KEY: &str = "token";

/// Looks up the bearer token for a named credential secret.
///
/// The reconciler depends only on this trait so tests can substitute a
/// canned double, the same seam `TagSource` gives the mirror engine.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<String>;
}

/// Resolver backed by namespace-local Kubernetes Secrets.
#[derive(Clone)]
pub struct SecretCredentialResolver {
    client: Client,
}

impl SecretCredentialResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialResolver for SecretCredentialResolver {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let secret = match secrets.get(name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(Error::SecretNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(Error::KubeError(e)),
        };

        let data = secret.data.unwrap_or_default();
        let payload = data.get(TOKEN_KEY).ok_or_else(|| Error::MissingSecretKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: TOKEN_KEY,
        })?;

        debug!("Resolved credential secret {}/{}", namespace, name);
        decode_token(&payload.0)
    }
}

/// Decode the stored payload into the bearer token.
///
/// The payload bytes are base64 text wrapping the actual token.
fn decode_token(payload: &[u8]) -> Result<String> {
    let text = String::from_utf8(payload.to_vec()).map_err(Error::CredentialUtf8)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(text.trim_end())
        .map_err(Error::CredentialDecode)?;
    String::from_utf8(decoded).map_err(Error::CredentialUtf8)
}
