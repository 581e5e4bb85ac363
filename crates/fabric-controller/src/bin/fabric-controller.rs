use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use fabric_controller::model::{HostRecord, HostStatus, HypervisorType, ServiceOffering};
use fabric_controller::store::DynStore;
use fabric_controller::{
    AllocateRequest, ControlClient, ControlServer, ControllerConfig, FabricDaemon, FleetStore,
    MemStore, Orchestrator, RequestEnvelope, SimulatedFleet, SqliteStore,
};
use fabric_protocol::HostId;

#[derive(Parser, Debug)]
#[command(name = "fabric-controller", version, about = "VM lifecycle controller")]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, global = true, default_value = "fabric-controller.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller daemon
    Serve(ServeArgs),

    /// Create a new instance in the stopped state
    Allocate(AllocateArgs),

    /// Place and boot an instance
    Start {
        instance: u64,
        /// Deploy on this host instead of planning
        #[arg(long)]
        host: Option<u64>,
    },

    /// Stop an instance
    Stop {
        instance: u64,
        /// Abandon in-flight work and tolerate an unreachable host
        #[arg(long)]
        forced: bool,
    },

    /// Reboot a running instance
    Reboot { instance: u64 },

    /// Live-migrate an instance to a host
    Migrate { instance: u64, host: u64 },

    /// Move an instance off a host to wherever there is room
    MigrateAway { instance: u64, host: u64 },

    /// Destroy an instance (recoverable until expunged)
    Destroy { instance: u64 },

    /// Permanently remove a destroyed instance
    Expunge { instance: u64 },

    /// Bring a destroyed instance back to stopped
    Recover { instance: u64 },

    /// Attach an instance to a network, hot-plugging when it is running
    AddNic { instance: u64, network: u64 },

    /// Detach an instance from a network
    RemoveNic { instance: u64, network: u64 },

    /// Show an instance
    Show { instance: u64 },

    /// Stop a running daemon
    Shutdown,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// SQLite database; in-memory when omitted
    #[arg(long)]
    db: Option<PathBuf>,

    /// Number of simulated hosts to register
    #[arg(long, default_value_t = 3)]
    sim_hosts: u64,

    /// Overrides FABRIC_NODE_ID
    #[arg(long)]
    node_id: Option<u64>,
}

#[derive(Args, Debug)]
struct AllocateArgs {
    #[arg(long)]
    account: u64,
    #[arg(long, default_value_t = 1)]
    zone: u64,
    #[arg(long, default_value_t = 1)]
    offering: u64,
    #[arg(long, default_value_t = 1)]
    template: u64,
    #[arg(long, default_value = "simulator")]
    hypervisor: String,
    /// Idempotency key; repeating it returns the same instance
    #[arg(long)]
    uuid: Option<String>,
    #[arg(long = "network")]
    networks: Vec<u64>,
    #[arg(long, default_value_t = 20)]
    root_disk_gb: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let (cmd, payload) = match cli.command {
        Command::Serve(args) => return serve(&cli.socket, args).await,
        Command::Allocate(args) => {
            let hypervisor = HypervisorType::parse(&args.hypervisor)
                .with_context(|| format!("unknown hypervisor '{}'", args.hypervisor))?;
            let mut request =
                AllocateRequest::new(args.account, args.zone, args.offering, args.template, hypervisor);
            request.uuid = args.uuid;
            request.networks = args.networks;
            request.root_disk_gb = args.root_disk_gb;
            ("allocate", serde_json::to_value(&request)?)
        }
        Command::Start { instance, host } => ("start", json!({ "instance": instance, "host": host })),
        Command::Stop { instance, forced } => {
            ("stop", json!({ "instance": instance, "forced": forced }))
        }
        Command::Reboot { instance } => ("reboot", json!({ "instance": instance })),
        Command::Migrate { instance, host } => {
            ("migrate", json!({ "instance": instance, "host": host }))
        }
        Command::MigrateAway { instance, host } => {
            ("migrate-away", json!({ "instance": instance, "host": host }))
        }
        Command::Destroy { instance } => ("destroy", json!({ "instance": instance })),
        Command::Expunge { instance } => ("expunge", json!({ "instance": instance })),
        Command::Recover { instance } => ("recover", json!({ "instance": instance })),
        Command::AddNic { instance, network } => {
            ("add-nic", json!({ "instance": instance, "network": network }))
        }
        Command::RemoveNic { instance, network } => {
            ("remove-nic", json!({ "instance": instance, "network": network }))
        }
        Command::Show { instance } => ("show", json!({ "instance": instance })),
        Command::Shutdown => ("shutdown", json!({})),
    };
    request(&cli.socket, cmd, payload).await
}

async fn request(socket: &Path, cmd: &str, payload: serde_json::Value) -> Result<()> {
    let mut client = ControlClient::connect(socket)
        .await
        .with_context(|| format!("connect to {}", socket.display()))?;
    let resp = client
        .request(&RequestEnvelope::new(uuid::Uuid::new_v4().to_string(), cmd, payload))
        .await?;
    if !resp.ok {
        match resp.error {
            Some(err) => bail!("{} failed ({}): {}", cmd, err.code, err.message),
            None => bail!("{cmd} failed"),
        }
    }
    let result = resp.result.unwrap_or_else(|| json!({}));
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(socket: &Path, args: ServeArgs) -> Result<()> {
    setup_logging();

    let mut config = ControllerConfig::from_env()?;
    if let Some(node) = args.node_id {
        config.node_id = node;
    }
    let store: DynStore = match &args.db {
        Some(path) => Arc::new(
            SqliteStore::open(path).with_context(|| format!("open {}", path.display()))?,
        ),
        None => Arc::new(MemStore::new()),
    };

    let (fleet, events_rx) = SimulatedFleet::new();
    let fleet = Arc::new(fleet);
    let hosts = seed(store.as_ref(), &fleet, args.sim_hosts)?;

    let (orchestrator, recovery_rx) = Orchestrator::builder(store, fleet.clone())
        .config(config)
        .build();
    let orchestrator = Arc::new(orchestrator);

    // Set up channels
    let (control_tx, control_rx) = mpsc::channel(128);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl-C and SIGTERM for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_tx_clone.send(());
    });

    let server = ControlServer::new(socket.to_path_buf(), control_tx.clone(), shutdown_tx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!("control server error: {e}");
        }
    });
    tracing::info!(socket = %socket.display(), hosts = hosts.len(), "control socket ready");

    for host in hosts {
        fleet.connect(host);
    }

    let mut daemon = FabricDaemon::new(
        orchestrator,
        recovery_rx,
        events_rx,
        control_rx,
        shutdown_rx,
        Some(server_handle),
    );
    daemon.run().await?;
    Ok(())
}

/// Register the simulated hosts and a couple of offerings.
fn seed(store: &dyn FleetStore, fleet: &SimulatedFleet, count: u64) -> Result<Vec<HostId>> {
    let mut hosts = Vec::new();
    for n in 1..=count {
        let id = HostId(n);
        store.upsert_host(&HostRecord {
            id,
            name: format!("sim-{n}"),
            zone_id: 1,
            pod_id: 1,
            cluster_id: 1 + (n - 1) / 4,
            hypervisor: HypervisorType::Simulator,
            status: HostStatus::Up,
            enabled: true,
            private_ip: format!("10.0.0.{n}"),
            cpus: 8,
            cpu_speed_mhz: 2000,
            memory_mb: 16 * 1024,
        })?;
        fleet.add_host(id);
        hosts.push(id);
    }
    for (id, name, cpus, memory_mb) in [(1, "small", 1, 1024), (2, "medium", 2, 4096)] {
        store.upsert_offering(&ServiceOffering {
            id,
            name: name.into(),
            cpus,
            cpu_speed_mhz: 1000,
            memory_mb,
            ha_enabled: true,
            local_storage: false,
        })?;
    }
    Ok(hosts)
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
