/*
* Cloud Scheduler Command Line Interface
* --------------------------------------
* @project: cloud-scheduler
*
* cloud-scheduler
* ├── init [--force]        // writes config/default.toml with a sample inventory
* ├── status [--json]       // loads the inventory and shows every cluster's ledger
* └── simulate              // runs the whole lifecycle against in-memory clouds
*     --count N --memory MB --network NET --arch ARCH [--flaky]
*
* `simulate` keeps the configured inventory (slots, memory blocks, archs,
* networks) but swaps every backend for a SimulatedBackend, so you can watch
* first-fit placement, polling and destroy retries without touching a cloud.
*/

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::backends::{CloudBackend, NimbusBackend, SimulatedBackend};
use crate::config::{generate_default_config, Settings};
use crate::core::{Cluster, ClusterSpec, ResourcePool, VMRequest, VMStatus};
use crate::errors::CloudError;
use crate::monitoring::{ClusterSnapshot, SchedulerMetrics};
use crate::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "cloud-scheduler")]
#[command(about = "Cloud meta-scheduler: first-fit VM placement across IaaS clusters", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = "config")]
        dir: PathBuf,
    },
    /// Show the configured pool and its capacity
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run create/poll/destroy against simulated backends
    Simulate {
        #[arg(short, long, default_value_t = 3)]
        count: usize,
        #[arg(short, long, default_value_t = 1024)]
        memory: u64,
        #[arg(short, long, default_value = "public")]
        network: String,
        #[arg(short, long, default_value = "x86")]
        arch: String,
        #[arg(long, default_value = "http://images.example.org/worker.img")]
        image: String,
        /// Poll rounds before tearing everything down
        #[arg(long, default_value_t = 2)]
        polls: u32,
        /// Make every backend fail its first shutdown and kill
        #[arg(long)]
        flaky: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Init { force, dir } => handle_init_command(force, &dir),
        Commands::Status { json } => handle_status_command(&load_settings(config)?, json).await,
        Commands::Simulate {
            count,
            memory,
            network,
            arch,
            image,
            polls,
            flaky,
        } => {
            let settings = load_settings(config)?;
            let request = VMRequest::new("sim-vm", network, arch, image, memory);
            handle_simulate_command(&settings, &request, count, polls, flaky).await
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::new_from_file(path)?,
        None => Settings::new()?,
    };
    Ok(settings)
}

/// Builds the pool from the inventory, one backend per cluster.
pub fn build_pool<F>(settings: &Settings, metrics: &Arc<SchedulerMetrics>, mut backend_for: F) -> Result<ResourcePool>
where
    F: FnMut(&ClusterSpec) -> Result<Arc<dyn CloudBackend>>,
{
    let policy = settings.scheduler.lifecycle_policy();
    let mut pool = ResourcePool::new(settings.scheduler.pool_name.clone());
    for spec in settings.cluster_specs()? {
        let backend = backend_for(&spec)?;
        pool.add(Arc::new(Cluster::new(spec, backend, policy, Arc::clone(metrics))));
    }
    Ok(pool)
}

fn configured_backend(settings: &Settings, spec: &ClusterSpec) -> Result<Arc<dyn CloudBackend>> {
    match spec.cloud_type.as_str() {
        "Nimbus" => Ok(Arc::new(NimbusBackend::new(
            spec.network_address.clone(),
            settings.nimbus.clone(),
        ))),
        "Simulated" => Ok(Arc::new(SimulatedBackend::new())),
        other => bail!(
            "cluster {} uses {}, which needs a provisioning API binding from the embedding application",
            spec.name,
            other
        ),
    }
}

async fn handle_status_command(settings: &Settings, json: bool) -> Result<()> {
    let metrics = Arc::new(SchedulerMetrics::new());
    let pool = build_pool(settings, &metrics, |spec| configured_backend(settings, spec))?;
    let snapshots = pool.snapshot().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    println!("{}", pool.describe().bold());
    for snapshot in &snapshots {
        print_cluster(snapshot);
    }
    Ok(())
}

async fn handle_simulate_command(
    settings: &Settings,
    template: &VMRequest,
    count: usize,
    polls: u32,
    flaky: bool,
) -> Result<()> {
    let metrics = Arc::new(SchedulerMetrics::new());
    let pool = build_pool(settings, &metrics, |_| {
        let backend = SimulatedBackend::new().with_boot_polls(2);
        if flaky {
            backend.fail_next_shutdowns(1);
            backend.fail_next_kills(1);
        }
        Ok(Arc::new(backend) as Arc<dyn CloudBackend>)
    })?;
    if pool.is_empty() {
        bail!("no clusters configured, run `cloud-scheduler init` first");
    }
    let scheduler = Scheduler::new(pool, metrics);

    println!("{}", "Requesting VMs:".bold());
    for i in 0..count {
        let request = VMRequest {
            name: format!("{}-{}", template.name, i),
            ..template.clone()
        };
        match scheduler.request_vm(&request).await {
            Ok(placement) => println!(
                "{} {} -> {} ({})",
                "✓".green(),
                request.name,
                placement.cluster.name(),
                placement.vm.backend_id
            ),
            Err(CloudError::NoResource { .. }) => {
                println!("{} {}: no cluster has room", "✗".red(), request.name)
            }
            Err(e) => println!("{} {}: {}", "✗".red(), request.name, e),
        }
    }

    for round in 1..=polls {
        println!("{}", format!("Poll round {}:", round).bold());
        for (vm, outcome) in scheduler.poll_all().await {
            println!("\t{} [{}]", vm.describe(), colour_status(outcome.status));
        }
    }

    for snapshot in scheduler.pool().snapshot().await {
        print_cluster(&snapshot);
    }

    let released = scheduler.release_all("simulation finished").await;
    info!(released, "Simulation torn down");
    scheduler.shutdown().await;

    println!("{}", "After teardown:".bold());
    for snapshot in scheduler.pool().snapshot().await {
        print_cluster(&snapshot);
    }
    let summary = serde_json::to_string_pretty(&scheduler.metrics().snapshot())?;
    println!("{}\n{}", "Metrics:".bold(), summary);
    Ok(())
}

fn handle_init_command(force: bool, dir: &Path) -> Result<()> {
    let target = dir.join("default.toml");
    if target.exists() && !force {
        println!(
            "{} {} already exists. Use --force to overwrite.",
            "!".yellow(),
            target.display()
        );
        return Ok(());
    }

    generate_default_config()
        .write_toml(&target)
        .with_context(|| format!("writing {}", target.display()))?;
    println!("{} Default configuration generated at {}", "✓".green(), target.display());
    Ok(())
}

fn colour_status(status: VMStatus) -> colored::ColoredString {
    match status {
        VMStatus::Running => "Running".green(),
        VMStatus::Starting => "Starting".yellow(),
        VMStatus::Error => "Error".red(),
        VMStatus::Shutdown => "Shutdown".dimmed(),
    }
}

fn print_cluster(snapshot: &ClusterSnapshot) {
    let join = |items: Vec<String>| items.join(", ");
    println!("{}", "-".repeat(80));
    println!("Name:\t\t{}", snapshot.name.bold());
    println!("Address:\t{}", snapshot.network_address);
    println!("Type:\t\t{}", snapshot.cloud_type);
    println!("VM Slots:\t{}", snapshot.vm_slots);
    println!("CPU Cores:\t{}", snapshot.cpu_cores);
    println!("Storage:\t{}", snapshot.storage_gb);
    println!(
        "Memory:\t\t{}",
        join(snapshot.memory_blocks.iter().map(|m| m.to_string()).collect())
    );
    println!("CPU Archs:\t{}", join(snapshot.cpu_archs.clone()));
    println!("Network Pools:\t{}", join(snapshot.network_pools.clone()));
    if snapshot.vms.is_empty() {
        println!("VMs:\t\tnone");
    } else {
        println!("VMs:");
        for vm in &snapshot.vms {
            println!("\t{}", vm.describe());
        }
    }
    println!("{}", "-".repeat(80));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cloud-scheduler-cli-{}", uuid::Uuid::new_v4().simple()))
    }

    #[tokio::test]
    async fn init_writes_defaults_without_loading_settings() {
        let dir = scratch_dir();
        // A config file that does not exist would fail any settings load.
        let cli = Cli::try_parse_from([
            "cloud-scheduler",
            "--config",
            "/nonexistent/cloud-scheduler.toml",
            "init",
            "--dir",
            dir.to_str().unwrap(),
        ])
        .unwrap();

        run(cli).await.unwrap();
        let written = Settings::new_from_file(&dir.join("default.toml")).unwrap();
        assert_eq!(written.clusters, generate_default_config().clusters);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn status_reports_a_missing_config_file() {
        let cli = Cli::try_parse_from([
            "cloud-scheduler",
            "--config",
            "/nonexistent/cloud-scheduler.toml",
            "status",
        ])
        .unwrap();

        assert!(run(cli).await.is_err());
    }
}
