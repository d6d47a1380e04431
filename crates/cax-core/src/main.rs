// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! cax - data movement agent.
//!
//! One agent runs per storage site. With no subcommand it enters the
//! polling loop and keeps moving data until interrupted; subcommands run a
//! single task pass and exit, for cron-style deployments and operator
//! intervention.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use cax_core::backend::{CliBackends, RucioBackend};
use cax_core::checksum::Sha512Checksum;
use cax_core::config::{Config, HostRegistry};
use cax_core::scheduler::SchedulerBuilder;
use cax_core::store::{RunFilter, RunStore, SqliteStore};
use cax_core::tasks::{
    ClearTask, RucioRuleTask, StaleTask, Task, TaskStats, TransferDirection, TransferTask,
    VerifyTask,
};

#[derive(Parser)]
#[command(name = "cax", about = "Detector run data movement agent", version)]
struct Cli {
    /// Restrict to a single run by name.
    #[arg(long, global = true)]
    run: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Push local data to the configured upload peers once.
    Push,
    /// Pull remote data from the configured download peers once.
    Pull,
    /// Verify local copies awaiting checksum confirmation once.
    Verify,
    /// Flag and purge stale transfers once.
    Stale,
    /// Clear safe untriggered buffers once.
    Clear,
    /// Reconcile Rucio replication rules once.
    RucioRules {
        /// Path to the JSON rule definitions file.
        #[arg(long)]
        rules_file: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cax_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        anyhow::anyhow!(e)
    })?;

    let registry = Arc::new(
        HostRegistry::from_file(&config.hosts_file)
            .with_context(|| format!("loading host registry from {}", config.hosts_file))?,
    );
    if registry.get(&config.host).is_none() {
        anyhow::bail!("host '{}' is not in the host registry", config.host);
    }

    let store: Arc<dyn RunStore> = Arc::new(
        SqliteStore::from_path(&config.database_url)
            .await
            .with_context(|| format!("opening run store at {}", config.database_url))?,
    );
    store.health_check().await?;
    info!(host = %config.host, database = %config.database_url, "cax agent initialized");

    let mut filter = RunFilter {
        exclude_tags: vec!["donotprocess".to_string()],
        ..RunFilter::default()
    };
    filter.name = cli.run.clone();

    let backends = Arc::new(CliBackends::new());
    let checksum = Arc::new(Sha512Checksum);

    let push = Arc::new(TransferTask::new(
        TransferDirection::Push,
        &config.host,
        registry.clone(),
        store.clone(),
        backends.clone(),
    ));
    let pull = Arc::new(
        TransferTask::new(
            TransferDirection::Pull,
            &config.host,
            registry.clone(),
            store.clone(),
            backends.clone(),
        )
        .with_checksum(checksum.clone()),
    );
    let verify = Arc::new(VerifyTask::new(
        &config.host,
        store.clone(),
        checksum.clone(),
    ));
    let stale = Arc::new(StaleTask::new(
        &config.host,
        store.clone(),
        chrono::Duration::hours(24),
        chrono::Duration::hours(72),
    ));
    let clear = Arc::new(ClearTask::new(&config.host, store.clone()));

    match cli.command {
        None => {
            let scheduler = SchedulerBuilder::new()
                .task(push)
                .task(pull)
                .task(verify)
                .task(stale)
                .task(clear)
                .filter(filter)
                .poll_interval(config.poll_interval)
                .build();

            let shutdown = scheduler.shutdown_handle();
            let handle = tokio::spawn(async move { scheduler.run().await });

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
            shutdown.notify_one();
            handle.await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(command) => {
            let task: Arc<dyn Task> = match command {
                Command::Push => push,
                Command::Pull => pull,
                Command::Verify => verify,
                Command::Stale => stale,
                Command::Clear => clear,
                Command::RucioRules { rules_file } => {
                    let text = std::fs::read_to_string(&rules_file)
                        .with_context(|| format!("reading rule definitions from {}", rules_file))?;
                    let definitions = serde_json::from_str(&text)
                        .with_context(|| format!("parsing rule definitions in {}", rules_file))?;
                    let client = Arc::new(RucioBackend::new(None));
                    Arc::new(RucioRuleTask::new(store.clone(), client, definitions))
                }
            };

            let stats: TaskStats = task.go(&filter).await?;
            info!(
                task = task.name(),
                runs = stats.runs_seen,
                errors = stats.errors,
                "task pass completed"
            );
            if stats.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
