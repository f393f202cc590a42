//! Survey ingest command.
//!
//! Runs one ingestion: reads the input, geolocates every photograph against
//! the GPS log, uploads the images and stores the resulting route.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (`config/ingest`, `/etc/roadsurvey/ingest`)
//! 2. Environment variables (prefixed with `INGEST__`)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use aws_config::BehaviorVersion;
use clap::{Args, Parser, Subcommand};
use roadsurvey_ingest::config::{IngestConfig, LoggingConfig};
use roadsurvey_ingest::{DigestRequest, Digester, RoadsClient};
use roadsurvey_pipeline::SurveyProducer;
use roadsurvey_storage::{DynamoStore, S3ObjectStore, SurveyStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "survey-ingest", version, about = "Ingest a road survey run")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Owner of the new route
    #[arg(long = "user", env = "INGEST_USER_ID", global = true)]
    user_id: Option<String>,

    /// Snap positions to roads before interpolating
    #[arg(long, global = true)]
    snap_to_roads: bool,

    /// Route name; defaults to a prefix of the route id
    #[arg(long, global = true)]
    name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Zip archive in the object store; deleted and announced on success
    Archive {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
    },
    /// Files already uploaded under one flat prefix
    Prefix {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        prefix: String,
    },
    /// Files on local disk
    Local {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "roadsurvey-ingest",
        version = env!("CARGO_PKG_VERSION"),
        "Starting survey ingest"
    );

    let snap_to_roads = cli.run.snap_to_roads || config.digest.snap_to_roads;
    config.validate(snap_to_roads)?;

    let user_id = cli
        .run
        .user_id
        .clone()
        .context("--user (or INGEST_USER_ID) is required")?;
    let request = DigestRequest::new(user_id)
        .with_snap_to_roads(snap_to_roads)
        .with_route_name(cli.run.name.clone());

    let digester = build_digester(&config).await?;

    let result = match cli.command {
        Command::Archive { bucket, key } => digester.digest_archive(&bucket, &key, &request).await,
        Command::Prefix { bucket, prefix } => {
            digester.digest_prefix(&bucket, &prefix, &request).await
        }
        Command::Local { files } => digester.digest_local(files, &request).await,
    };

    match result {
        Ok(route) => {
            info!(
                route_id = %route.route_id,
                name = %route.name,
                buckets = route.bucket_keys.len(),
                "Ingest completed successfully"
            );
            println!("{}", route.route_id);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ingest failed");
            Err(e.into())
        }
    }
}

/// Load configuration.
fn load_config() -> anyhow::Result<IngestConfig> {
    // Try loading from files first, fall back to environment
    let config = IngestConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        IngestConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("roadsurvey_ingest={}", level).parse()?)
        .add_directive(format!("roadsurvey_storage={}", level).parse()?)
        .add_directive("rdkafka=warn".parse()?)
        .add_directive("aws_config=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Wire storage, the road-snap client and the notifier.
async fn build_digester(config: &IngestConfig) -> anyhow::Result<Digester> {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let kv = Arc::new(DynamoStore::new(&sdk_config, &config.dynamo));
    let objects = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );
    let store = Arc::new(SurveyStore::new(kv, objects, config.limits.clone()));

    let snapper = Arc::new(RoadsClient::new(&config.roads).context("Failed to build roads client")?);
    let notifier = Arc::new(
        SurveyProducer::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );

    Ok(Digester::new(
        store,
        snapper,
        notifier,
        config.digest.image_prefix.clone(),
    ))
}
