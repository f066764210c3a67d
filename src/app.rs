use crate::bootstrap::{ListenerManifest, DEFAULT_LISTENER_IMAGE};
use crate::config::Settings;
use crate::kubernetes::{ConfigMapWatermarkStore, Kubectl, KubectlApplier};
use crate::logging::init_tracing;
use crate::manifests::collect_manifests;
use crate::message::BuildIdentifier;
use crate::publisher::{BuildProvenance, Publisher};
use crate::queue::{CredentialProvider, CredentialSource, QueueResolver, SqsClient};
use crate::reconcile::ReconciliationLoop;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

/// Queue-driven continuous deployment for a Kubernetes namespace.
#[derive(Debug, Parser)]
#[command(name = "kube-pico-cd", version, about, long_about = None)]
pub struct Cli {
    /// Settings file (TOML). Defaults to $KUBE_PICO_CD_SETTINGS when set.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Log level or filter directive (overrides RUST_LOG and the settings file)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll the deploy queue and apply every build not older than the cluster watermark
    #[command(alias = "start_listener")]
    StartListener {
        /// Kubernetes namespace (defaults to the configured or service-account namespace)
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Publish all .yaml files below a directory as one deployment
    Deploy {
        /// Name of the deployment queue (defaults to the configured queue)
        #[arg(long, alias = "deploy_queue_name")]
        deploy_queue_name: Option<String>,

        /// Directory searched recursively for manifests
        #[arg(long, alias = "manifests_root", default_value = ".")]
        manifests_root: PathBuf,

        /// Build identifier (defaults to the current UNIX time)
        #[arg(long, env = "BUILD_TIMESTAMP")]
        identifier: Option<BuildIdentifier>,
    },

    /// Write the manifest that installs the listener into a namespace
    #[command(alias = "generate_manifest")]
    GenerateManifest {
        /// Target namespace
        namespace: String,

        /// Name of the deployment queue
        deploy_queue_name: String,

        /// AWS region of the queue
        aws_region: String,

        /// Output file (defaults to kube-pico-cd-<namespace>.yaml)
        #[arg(long, alias = "manifest_file_name")]
        manifest_file_name: Option<PathBuf>,

        /// Listener container image
        #[arg(long, default_value = DEFAULT_LISTENER_IMAGE)]
        image: String,

        /// IAM role bound to the listener's service account (IRSA)
        #[arg(long, alias = "role_arn")]
        role_arn: Option<String>,
    },
}

/// Application entrypoint: parse flags, load settings, start logging, dispatch.
pub fn run() -> Result<()> {
    run_cli(Cli::parse())
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.settings.as_deref()).context("failed to load settings")?;
    init_tracing(
        cli.log_level.as_deref(),
        &settings.log_level,
        settings.log_format,
    )?;

    match cli.command.unwrap_or(Command::StartListener { namespace: None }) {
        Command::StartListener { namespace } => {
            if namespace.is_some() {
                settings.namespace = namespace;
            }
            start_listener(&settings)
        }
        Command::Deploy {
            deploy_queue_name,
            manifests_root,
            identifier,
        } => deploy(&settings, deploy_queue_name, manifests_root, identifier),
        Command::GenerateManifest {
            namespace,
            deploy_queue_name,
            aws_region,
            manifest_file_name,
            image,
            role_arn,
        } => {
            let mut manifest = ListenerManifest::new(namespace, deploy_queue_name, aws_region)?
                .with_image(image);
            if let Some(role_arn) = role_arn {
                manifest = manifest.with_role_arn(role_arn);
            }
            let path = manifest.write(manifest_file_name.as_deref())?;
            info!(path = %path.display(), "manifest file generated");
            Ok(())
        }
    }
}

fn sqs_client(settings: &Settings) -> Result<SqsClient> {
    let region = settings
        .aws_region
        .as_deref()
        .context("aws region is not configured (set AWS_REGION or KUBE_PICO_CD_AWS_REGION)")?;
    let source = CredentialSource::from_env()?;
    info!(source = source.kind(), "resolving aws credentials");
    let credentials = CredentialProvider::new(source, region)?;
    Ok(SqsClient::new(
        region,
        settings.sqs_endpoint.as_deref(),
        credentials,
    )?)
}

fn start_listener(settings: &Settings) -> Result<()> {
    let config = settings.listener()?;
    info!(namespace = %config.namespace, queue = %config.queue_name, "starting listener");
    let mut client = sqs_client(settings)?;
    let queue = client
        .open(&config.queue_name)
        .with_context(|| format!("failed to open deploy queue {}", config.queue_name))?;
    let kubectl = Kubectl::new(&settings.kubectl);
    let watermarks = ConfigMapWatermarkStore::new(
        kubectl.clone(),
        config.namespace.clone(),
        config.identifier_key.clone(),
    );
    let applier = KubectlApplier::new(kubectl, config.namespace.clone());
    ReconciliationLoop::new(queue, watermarks, applier, config).run()
}

fn deploy(
    settings: &Settings,
    deploy_queue_name: Option<String>,
    manifests_root: PathBuf,
    identifier: Option<BuildIdentifier>,
) -> Result<()> {
    let queue_name = match deploy_queue_name.or_else(|| settings.deploy_queue_name.clone()) {
        Some(name) => name,
        None => anyhow::bail!("deploy_queue_name is neither given as argument nor set in settings"),
    };
    let manifests = collect_manifests(&manifests_root)?;
    info!(
        files = ?manifests.paths,
        "concatenated manifest files"
    );
    let mut publisher = Publisher::new(sqs_client(settings)?, settings.publisher());
    let receipt = publisher.publish(
        &queue_name,
        &manifests.bundle,
        identifier,
        BuildProvenance::from_env().into_metadata(),
    )?;
    info!(
        identifier = receipt.message.identifier,
        queue = %receipt.queue,
        "deployment published"
    );
    Ok(())
}
