//! introvisor - command-line front end
//!
//! ```text
//! introvisor --config introvisor.toml activate vm-1 --drive vda --target malware-scan
//! introvisor --config introvisor.toml list vm-1
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use introvisor::api::{ActivateRequest, IntrospectionApi};
use introvisor::compute::StaticInstanceRegistry;
use introvisor::config::IntrospectionConfig;
use introvisor::context::RequestContext;
use introvisor::driver::{IntrospectionCapability, IntrospectionDriver};
use introvisor::hypervisor::QemuDriver;
use introvisor::session::SessionManager;
use introvisor::store::{EntityRepository, EntityStore, JsonFileStore, MemoryStore};
use introvisor::tracing::{init_tracing, shutdown_tracing};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "introvisor", author, version, about = "Live virtual-disk introspection", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List introspected entities of an instance
    List { instance: String },
    /// Show one introspected entity
    Get { instance: String, entity_id: i64 },
    /// Introspect a drive and keep the session live until Ctrl-C
    Activate {
        instance: String,
        /// Drive device name (e.g., vda)
        #[arg(long)]
        drive: String,
        /// Introspection target (e.g., malware-scan)
        #[arg(long)]
        target: String,
    },
    /// Delete an introspected entity
    Deactivate { instance: String, entity_id: i64 },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => IntrospectionConfig::from_file(path)?,
        None => IntrospectionConfig::default(),
    };

    init_tracing(
        &config.tracing.service_name,
        config.tracing.otlp_endpoint.as_deref(),
    )?;

    let shutdown = CancellationToken::new();
    if let Some(addr) = config.metrics_addr {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = introvisor::metrics::serve(addr, token).await {
                tracing::error!(%addr, error = %e, "metrics server failed");
            }
        });
    }

    let result = run(cli.command, &config).await;

    shutdown.cancel();
    shutdown_tracing();
    result
}

async fn run(command: Commands, config: &IntrospectionConfig) -> Result<(), BoxError> {
    let store: Arc<dyn EntityStore> = match &config.store.path {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => {
            tracing::warn!("no store.path configured, entities are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    let repository = EntityRepository::new(store);

    let driver = Arc::new(QemuDriver::from_config(&config.hypervisor));
    let sessions = Arc::new(SessionManager::new(config, driver, repository.clone()));
    let capability = IntrospectionDriver::detect(Arc::clone(&sessions))
        .map(|d| Arc::new(d) as Arc<dyn IntrospectionCapability>);
    let instances = Arc::new(StaticInstanceRegistry::new(config.instances.clone()));
    let api = IntrospectionApi::new(instances, repository, capability);

    let ctx = RequestContext::new();
    match command {
        Commands::List { instance } => print_json(&api.list(&ctx, &instance).await?)?,
        Commands::Get {
            instance,
            entity_id,
        } => print_json(&api.get(&ctx, &instance, entity_id).await?)?,
        Commands::Deactivate {
            instance,
            entity_id,
        } => {
            api.deactivate(&ctx, &instance, entity_id).await?;
            println!("deactivated {}", entity_id);
        }
        Commands::Activate {
            instance,
            drive,
            target,
        } => {
            let request = ActivateRequest {
                drive_id: Some(drive),
                target: Some(target),
            };
            let created = api.activate(&ctx, &instance, request).await?;
            print_json(&created)?;

            tracing::info!("session live, press Ctrl-C to deactivate");
            tokio::signal::ctrl_c().await?;

            if let Some(id) = created.introspected_entity.introspected_entity_id {
                api.deactivate(&ctx, &instance, id).await?;
            }
            sessions.shutdown().await;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
