// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Firmware Upgrader.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Firmware Upgrader - Command line entry point

use anyhow::Context;
use clap::{Parser, Subcommand};
use firmware_upgrader::config::{DEFAULT_CONFIG_PATH, load_config, read_config};
use firmware_upgrader::inventory::{import_inventory, load_inventory};
use firmware_upgrader::model::{BatchId, BuildId, DeviceId, ImageId};
use firmware_upgrader::simulator::SimulatedFleet;
use firmware_upgrader::transport::Connector;
use firmware_upgrader::transport::ssh::SshConnector;
use firmware_upgrader::{
    BatchCoordinator, MemoryStore, SqliteStore, UpgradeStore, UpgraderConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "firmware-upgrader", version, about = "Remote firmware upgrades for OpenWrt fleets")]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run against simulated devices and an in-memory database
    #[arg(long, global = true)]
    simulate: bool,

    /// Inventory loaded into the in-memory database in simulation mode
    #[arg(long, global = true, requires = "simulate")]
    inventory: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import categories, builds, images and devices from a JSON file
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Upgrade every device eligible for a build
    Batch {
        #[arg(long)]
        build: BuildId,

        /// Also upgrade devices without any recorded firmware
        #[arg(long)]
        firmwareless: bool,
    },
    /// Upgrade a single device
    Upgrade {
        #[arg(long)]
        device: DeviceId,

        #[arg(long)]
        image: ImageId,
    },
    /// Show a batch and its operations
    Status {
        #[arg(long)]
        batch: BatchId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("firmware_upgrader=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();
    // a dry run leaves the filesystem alone
    let config = if cli.simulate {
        read_config(&cli.config)
    } else {
        load_config(&cli.config)
    };
    let mut config =
        config.with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let (store, connector) = if cli.simulate {
        simulation(&mut config, cli.inventory.as_deref())?
    } else {
        let store = SqliteStore::open(&config.database_path).with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?;
        let connector = SshConnector::new(config.ssh.clone(), config.timings.command_timeout());
        (
            Arc::new(store) as Arc<dyn UpgradeStore>,
            Arc::new(connector) as Arc<dyn Connector>,
        )
    };

    let coordinator = BatchCoordinator::new(store.clone(), connector, &config);

    match cli.command {
        Command::Import { file } => {
            let inventory = load_inventory(&file)
                .with_context(|| format!("Failed to read inventory {}", file.display()))?;
            let summary = import_inventory(store.as_ref(), &inventory)?;
            println!(
                "Imported {} categories, {} builds, {} images, {} devices",
                summary.categories, summary.builds, summary.images, summary.devices
            );
        }
        Command::Batch {
            build,
            firmwareless,
        } => {
            let report = coordinator
                .start(build, firmwareless)
                .await
                .with_context(|| format!("Batch upgrade of build {build} failed"))?;
            println!("{report}");
        }
        Command::Upgrade { device, image } => {
            let operation = coordinator
                .runner()
                .upgrade_device(device, image)
                .await
                .with_context(|| format!("Upgrade of device {device} failed"))?;
            println!("operation {}: {}", operation.id, operation.status);
            println!("{}", operation.log);
        }
        Command::Status { batch } => {
            let record = store.batch(batch)?;
            let summary = store.batch_summary(batch)?;
            println!("batch {} (build {}): {}", record.id, record.build_id, record.status);
            println!("progress: {}", summary.progress_report());
            println!(
                "success: {}, failed: {}, aborted: {}",
                summary.success_rate(),
                summary.failed_rate(),
                summary.aborted_rate()
            );
            for operation in store.batch_operations(batch)? {
                println!(
                    "  operation {} device {}: {}",
                    operation.id, operation.device_id, operation.status
                );
            }
        }
    }

    Ok(())
}

/// In-memory store and simulated fleet, with reboot delays disabled
fn simulation(
    config: &mut UpgraderConfig,
    inventory: Option<&Path>,
) -> anyhow::Result<(Arc<dyn UpgradeStore>, Arc<dyn Connector>)> {
    warn!("Simulation mode: no device will be contacted");
    config.timings.settle_delay_secs = 0;
    config.timings.retry_delay_secs = 0;

    let store = MemoryStore::new();
    if let Some(path) = inventory {
        let inventory = load_inventory(path)
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        import_inventory(&store, &inventory)?;
    } else {
        info!("No inventory given, starting with an empty database");
    }
    Ok((Arc::new(store), Arc::new(SimulatedFleet::new())))
}
