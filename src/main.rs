use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use image_mirror_operator::{controller, crd::ImageMirror, registry::RegistryClient, Error};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the mirrors managed in a namespace
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator namespace (used for the leader-election lease)
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Per-request timeout for registry calls, in seconds
    #[arg(long, env = "REGISTRY_TIMEOUT_SECS", default_value_t = 30)]
    registry_timeout_secs: u64,

    /// Disable leader election (single-replica deployments)
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to inspect
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Image Mirror Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<ImageMirror> = Api::namespaced(client, &args.namespace);
    let mirrors = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed mirrors: {}", mirrors.items.len());
    for m in mirrors.items {
        let name = m.metadata.name.as_deref().unwrap_or("<unnamed>");
        let mirrored = m
            .status
            .as_ref()
            .map(|s| s.mirrored_tags.len())
            .unwrap_or(0);
        println!(
            "  {name}: {} -> {} ({}, {mirrored} tags mirrored)",
            m.spec.source_repository, m.spec.dest_repository, m.spec.image_name
        );
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    info!(
        "Starting Image Mirror Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    // With leader election disabled this replica always reconciles.
    let is_leader = Arc::new(AtomicBool::new(args.disable_leader_election));

    if !args.disable_leader_election {
        let lease_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });

        info!("Leader election using holder ID: {}", identity);

        let lease_client = client.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_namespace, &identity, is_leader_bg).await;
        });
    }

    let registry = RegistryClient::new(Some(Duration::from_secs(args.registry_timeout_secs)))?;

    let state = Arc::new(controller::ControllerState {
        client,
        registry,
        is_leader,
    });

    controller::run_controller(state).await
}

const LEASE_NAME: &str = "image-mirror-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        let holding = match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(holding) => holding,
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                false
            }
        };

        let was_leader = is_leader.swap(holding, Ordering::Relaxed);
        match (was_leader, holding) {
            (false, true) => info!("Acquired leadership for lease {}", LEASE_NAME),
            (true, false) => warn!("Lost leadership for lease {}", LEASE_NAME),
            _ => {}
        }

        let sleep = if holding { RENEW_INTERVAL } else { RETRY_INTERVAL };
        tokio::time::sleep(sleep).await;
    }
}

/// Take or renew the leader lease. Returns whether this replica holds it.
async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let existing = match leases.get(LEASE_NAME).await {
        Ok(lease) => lease,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            return Ok(true);
        }
        Err(e) => return Err(e),
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());
    let held_by_us = current_holder == Some(identity);

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration.into())
        })
        .unwrap_or(true);

    if !held_by_us && !expired {
        return Ok(false);
    }

    if !held_by_us {
        info!(
            "Lease held by {:?} has expired, taking over",
            current_holder
        );
    }

    let mut patch = serde_json::json!({
        "spec": {
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    if !held_by_us {
        patch["spec"]["holderIdentity"] = serde_json::json!(identity);
        patch["spec"]["acquireTime"] = serde_json::to_value(MicroTime(now)).unwrap_or_default();
    }

    leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
