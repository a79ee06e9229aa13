use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use garde::Validate;
use kube::{Client, CustomResourceExt, ResourceExt};

use spire_operator::{
    api::{SpireAgent, SpireServer},
    client::KubeClusterClient,
    config::OperatorConfig,
    reconcilers::{self, ReconcilerCtx},
    render::{RenderOptions, RenderedConfig, render_agent, render_server},
    validation::{validate_agent, validate_server},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the controller reconciliation loop
    Reconcile {
        #[command(subcommand)]
        target: ReconcileTarget,
        #[command(flatten)]
        config: OperatorConfig,
    },
    /// Output K8s manifest for a given CRD resource
    #[command(subcommand)]
    CrdManifest(Crd),
    /// Validate a SpireServer or SpireAgent manifest and print its SPIRE config
    Render {
        manifest: PathBuf,
        /// Namespace to assume when the manifest has none
        #[arg(long, default_value = "default")]
        namespace: String,
        #[command(flatten)]
        config: OperatorConfig,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum ReconcileTarget {
    Servers,
    Agents,
    All,
}

#[derive(Debug, Clone, Subcommand)]
enum Crd {
    Server,
    Agent,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Reconcile { target, config }) => run_controller(target, config).await?,
        Some(Commands::CrdManifest(crd)) => {
            let crd = match crd {
                Crd::Server => SpireServer::crd(),
                Crd::Agent => SpireAgent::crd(),
            };

            println!("{}", serde_yaml_ng::to_string(&crd)?);
        }
        Some(Commands::Render {
            manifest,
            namespace,
            config,
        }) => {
            let rendered = render_manifest(&manifest, &namespace, &config.render_options())?;
            for (file_name, text) in rendered.data() {
                println!("# {file_name}\n{text}");
            }
        }
        None => {}
    }

    Ok(())
}

async fn run_controller(target: ReconcileTarget, config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("connect to k8s")?;
    let context = Arc::new(ReconcilerCtx::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        &config,
    ));

    match target {
        ReconcileTarget::Servers => drive_servers(client, context).await,
        ReconcileTarget::Agents => drive_agents(client, context).await,
        ReconcileTarget::All => {
            futures::join!(
                drive_servers(client.clone(), context.clone()),
                drive_agents(client, context)
            );
        }
    };

    tracing::info!("controller terminated");
    Ok(())
}

async fn drive_servers(client: Client, context: Arc<ReconcilerCtx>) {
    reconcilers::server::control_loop(client, context)
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("Reconciled server {:?}", o),
                Err(e) => tracing::error!("Server reconcile failed: {:?}", e),
            }
        })
        .await
}

async fn drive_agents(client: Client, context: Arc<ReconcilerCtx>) {
    reconcilers::agent::control_loop(client, context)
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("Reconciled agent {:?}", o),
                Err(e) => tracing::error!("Agent reconcile failed: {:?}", e),
            }
        })
        .await
}

/// Offline check: reports every field violation at once, then applies the
/// same ordered rules the reconciler uses. Agents are checked without a server.
fn render_manifest(
    path: &Path,
    namespace: &str,
    options: &RenderOptions,
) -> anyhow::Result<RenderedConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let manifest: serde_yaml_ng::Value = serde_yaml_ng::from_str(&text)?;
    let kind = manifest
        .get("kind")
        .and_then(|kind| kind.as_str())
        .unwrap_or_default()
        .to_string();

    match kind.as_str() {
        "SpireServer" => {
            let server: SpireServer = serde_yaml_ng::from_value(manifest)?;
            server
                .spec
                .validate()
                .map_err(|report| anyhow!("invalid SpireServer spec:\n{report}"))?;
            validate_server(&server.spec)?;
            let namespace = server.namespace().unwrap_or_else(|| namespace.to_string());
            Ok(render_server(&server.spec, &namespace, options))
        }
        "SpireAgent" => {
            let agent: SpireAgent = serde_yaml_ng::from_value(manifest)?;
            agent
                .spec
                .validate()
                .map_err(|report| anyhow!("invalid SpireAgent spec:\n{report}"))?;
            validate_agent(&agent.spec, None)?;
            Ok(render_agent(&agent.spec, options))
        }
        other => bail!("unsupported kind {other:?}, expected SpireServer or SpireAgent"),
    }
}
