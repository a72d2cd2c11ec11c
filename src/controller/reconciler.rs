//! Main reconciler for ImageMirror resources
//!
//! Implements the controller pattern using kube-rs runtime. Every change
//! notification re-runs the full cycle (level-triggered): load the
//! resource, resolve both registry credentials, run the mirror engine,
//! and persist the resulting mirrored-tags set. The runtime guarantees
//! at most one in-flight reconcile per object, which keeps concurrent
//! cycles of the same resource from writing divergent partial progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{ImageMirror, ImageMirrorSpec, ImageMirrorStatus, SpecValidationError};
use crate::error::{Error, Result};
use crate::mirror::{self, MirrorOutcome};
use crate::registry::{RegistryClient, TagSource};

use super::credentials::{CredentialResolver, SecretCredentialResolver};

/// Field manager used for status patches.
pub const FIELD_MANAGER: &str = "image-mirror-operator";

// Fixed retry delays; errors that tend to self-heal retry sooner.
const RETRIABLE_RETRY: Duration = Duration::from_secs(15);
const DEFAULT_RETRY: Duration = Duration::from_secs(60);
const NOT_LEADER_RETRY: Duration = Duration::from_secs(30);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub registry: RegistryClient,
    pub is_leader: Arc<AtomicBool>,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let mirrors: Api<ImageMirror> = Api::all(client.clone());

    info!("Starting ImageMirror controller");

    // Verify CRD exists
    match mirrors.list(&Default::default()).await {
        Ok(_) => info!("ImageMirror CRD is available"),
        Err(e) => {
            error!(
                "ImageMirror CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "ImageMirror CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(mirrors, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Called whenever an ImageMirror is created or updated, or a requeue
/// timer expires. Deletion needs no handling here: mirroring leaves no
/// external state that has to be reversed, so no finalizer is taken.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<ImageMirror>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(NOT_LEADER_RETRY));
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();
    let api: Api<ImageMirror> = Api::namespaced(ctx.client.clone(), &namespace);

    // Re-fetch so the cycle runs against the latest spec and status. A
    // concurrently deleted resource is a silent no-op, not an error.
    let image_mirror = match api.get(&name).await {
        Ok(m) => m,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("ImageMirror {}/{} is gone, nothing to do", namespace, name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::KubeError(e)),
    };

    info!(
        "Reconciling ImageMirror {}/{} (image: {})",
        namespace, name, image_mirror.spec.image_name
    );

    if let Err(errors) = image_mirror.spec.validate() {
        for e in &errors {
            warn!("Validation failed for {}/{}: {}: {}", namespace, name, e.field, e.message);
        }
        return Err(validation_error(&errors));
    }

    let previously_mirrored = image_mirror
        .status
        .as_ref()
        .map(|s| s.mirrored_tags.clone())
        .unwrap_or_default();

    let resolver = SecretCredentialResolver::new(ctx.client.clone());
    let outcome = resolve_and_mirror(
        &resolver,
        &ctx.registry,
        &namespace,
        &image_mirror.spec,
        &previously_mirrored,
    )
    .await?;

    // Persist progress even when the engine failed part-way: the status
    // must reflect true progress at all times, and the next cycle seeds
    // its diff from whatever was durably recorded.
    let status = ImageMirrorStatus {
        mirrored_tags: outcome.mirrored_tags.into_iter().collect(),
    };
    let tag_count = status.mirrored_tags.len();
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    match outcome.error {
        Some(e) => Err(e),
        None => {
            info!(
                "ImageMirror {}/{} in sync ({} tags mirrored)",
                namespace, name, tag_count
            );
            // Level-triggered: the watch delivers the next cycle.
            Ok(Action::await_change())
        }
    }
}

/// Fold every collected field error into one kubectl-visible message.
fn validation_error(errors: &[SpecValidationError]) -> Error {
    let detail = errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    Error::ConfigError(format!("invalid spec: {detail}"))
}

/// Resolve both registry credentials, then run one mirroring pass.
///
/// Credentials are resolved fresh every cycle, source side first.
/// Either failure aborts before any registry call, so a bad source
/// secret never triggers a destination lookup or a copy.
async fn resolve_and_mirror<C, S>(
    resolver: &C,
    tag_source: &S,
    namespace: &str,
    spec: &ImageMirrorSpec,
    previously_mirrored: &[String],
) -> Result<MirrorOutcome>
where
    C: CredentialResolver + ?Sized,
    S: TagSource + ?Sized,
{
    let source_token = resolver.resolve(namespace, &spec.source_secret_name).await?;
    let dest_token = resolver.resolve(namespace, &spec.dest_secret_name).await?;

    Ok(mirror::mirror_tags(tag_source, spec, previously_mirrored, &source_token, &dest_token).await)
}

/// Fixed retry delay for a failed cycle.
fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        RETRIABLE_RETRY
    } else {
        DEFAULT_RETRY
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(obj: Arc<ImageMirror>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!(
        "Reconciliation error for {}: {:?}",
        obj.name_any(),
        error
    );
    Action::requeue(retry_delay(error))
}
