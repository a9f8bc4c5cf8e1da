// meshlight: command-line control of a BLE mesh lighting network
//
// Talks to real lamps through the host's Bluetooth adapter, or to an
// in-process simulated mesh loaded from a scenario file.

mod ble;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use meshlight_core::address::{format_address, parse_mesh_address};
use meshlight_core::discovery::StaticDatabase;
use meshlight_core::{
    CompletionPolicy, CoreEvent, Delivery, DiscoveryReport, KeyMaterial, MeshCore, Scenario,
    SimulatedMesh, TriggerOptions, TriggerOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "meshlight")]
#[command(about = "Meshlight: BLE mesh lighting control", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run against a simulated mesh described by a scenario file
    #[arg(long, global = true, value_name = "SCENARIO")]
    simulate: Option<PathBuf>,

    /// Node subscription database (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan, connect a proxy and map group membership
    Discover {
        /// Overall budget in seconds
        #[arg(short, long)]
        budget: Option<u64>,
    },
    /// Switch a device or group
    Set {
        /// Unicast or group address (0x0012, C001, default)
        target: String,
        state: Switch,
        /// Ask for a status reply
        #[arg(long, conflicts_with = "unack")]
        ack: bool,
        /// Do not ask for a status reply
        #[arg(long)]
        unack: bool,
    },
    /// Ask a device or group for its state
    Get { target: String },
    /// Switch on and watch the devices report back
    Trigger {
        target: String,
        /// Monitor window in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
        #[arg(short, long, value_enum)]
        policy: Option<Policy>,
    },
    /// Print status reports and link events
    Monitor {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// List known devices
    Devices,
    /// List groups and their members
    Groups,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    Set { key: String, value: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    Any,
    OnThenOff,
}

impl From<Policy> for CompletionPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Any => CompletionPolicy::AnyStatus,
            Policy::OnThenOff => CompletionPolicy::OnThenOff,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.log_dir.as_deref())?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::Config::config_file()?,
    };

    if let Commands::Config { action } = &cli.command {
        return cmd_config(action, &config_path);
    }

    let config = config::Config::load(&config_path)?;
    let core = open_core(&cli, &config).await?;

    let result = match &cli.command {
        Commands::Discover { budget } => cmd_discover(&core, budget.map(Duration::from_secs)).await,
        Commands::Set {
            target,
            state,
            ack,
            unack,
        } => {
            let acknowledged = match (ack, unack) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_set(&core, target, matches!(state, Switch::On), acknowledged).await
        }
        Commands::Get { target } => cmd_get(&core, target).await,
        Commands::Trigger {
            target,
            timeout,
            policy,
        } => {
            let options = TriggerOptions {
                timeout: timeout.map(Duration::from_millis),
                policy: policy.map(CompletionPolicy::from),
            };
            cmd_trigger(&core, target, options).await
        }
        Commands::Monitor { duration } => cmd_monitor(&core, duration.map(Duration::from_secs)).await,
        Commands::Devices => cmd_devices(&core).await,
        Commands::Groups => cmd_groups(&core).await,
        Commands::Config { .. } => Ok(()),
    };

    core.shutdown().await.context("Shutdown failed")?;
    result
}

fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    let stderr = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "meshlight.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

async fn open_core(cli: &Cli, config: &config::Config) -> Result<MeshCore> {
    let mut mesh_config = config.mesh.clone();

    let builder = match &cli.simulate {
        Some(path) => {
            let scenario = Scenario::load(path)
                .with_context(|| format!("Failed to load scenario {}", path.display()))?;
            if mesh_config.keys.validate().is_err() {
                println!("{}", "No keys configured, using simulator keys".yellow());
                mesh_config.keys = KeyMaterial::new([0x5A; 16], [0xA5; 16], 0);
            }
            let mesh = SimulatedMesh::new(scenario, &mesh_config.keys)
                .context("Failed to start simulated mesh")?;
            MeshCore::builder(mesh_config).simulated(&mesh)
        }
        None => {
            let link = ble::BleLink::open(config.ble.clone()).await;
            MeshCore::builder(mesh_config)
                .bearer(Arc::new(link.clone()))
                .scanner(Arc::new(link.clone()))
                .gatt(Arc::new(link))
                .storage_path(config.storage_dir()?)
                .context("Failed to open sequence storage")?
        }
    };

    let builder = match &cli.database {
        Some(path) => {
            let database = StaticDatabase::load(path)
                .with_context(|| format!("Failed to load database {}", path.display()))?;
            builder.database(Arc::new(database))
        }
        None => builder,
    };

    builder.build().context("Failed to start mesh core")
}

/// Run discovery so there is a proxy and a device model to work with
async fn prepare(core: &MeshCore) -> Result<DiscoveryReport> {
    let report = core
        .run_startup_discovery(None)
        .await
        .context("Discovery failed")?;
    if report.proxy.is_none() {
        println!(
            "{} no proxy connected, falling back to direct control where possible",
            "!".yellow()
        );
    }
    Ok(report)
}

fn target(input: &str) -> Result<u16> {
    parse_mesh_address(input).with_context(|| format!("Invalid target {}", input))
}

fn print_delivery(destination: u16, delivery: Delivery) {
    match delivery {
        Delivery::Sent(kind) => println!(
            "  {} {} via {}",
            "✓".green(),
            format_address(destination),
            kind
        ),
        Delivery::Failed => println!("  {} {} delivery failed", "✗".red(), format_address(destination)),
        Delivery::Unavailable => println!(
            "  {} {} no transport available",
            "✗".red(),
            format_address(destination)
        ),
    }
}

fn state_label(on: bool) -> ColoredString {
    if on {
        "on".bright_green()
    } else {
        "off".dimmed()
    }
}

async fn cmd_discover(core: &MeshCore, budget: Option<Duration>) -> Result<()> {
    println!("{}", "Discovering mesh...".bold());
    let report = core
        .run_startup_discovery(budget)
        .await
        .context("Discovery failed")?;

    println!();
    println!("  Devices found: {}", report.devices_found.to_string().bright_cyan());
    match report.proxy {
        Some(proxy) => println!("  Proxy:         {}", proxy.to_string().bright_cyan()),
        None => println!("  Proxy:         {}", "none".yellow()),
    }
    for group in &report.groups {
        let members: Vec<String> = group.responders.iter().map(|a| format!("0x{:04X}", a)).collect();
        println!(
            "  Group {}: {}",
            format_address(group.group).bright_yellow(),
            if members.is_empty() {
                "(no responders)".dimmed().to_string()
            } else {
                members.join(", ")
            }
        );
    }
    println!(
        "  Finished in {:.1}s{}",
        report.elapsed.as_secs_f64(),
        if report.deadline_hit {
            " (budget exhausted)".yellow().to_string()
        } else {
            String::new()
        }
    );
    Ok(())
}

async fn cmd_set(core: &MeshCore, input: &str, on: bool, acknowledged: Option<bool>) -> Result<()> {
    let destination = target(input)?;
    prepare(core).await?;
    let mut events = core.subscribe();

    let delivery = core.set_state(destination, on, acknowledged).await?;
    print_delivery(destination, delivery);
    if delivery.is_sent() && acknowledged.unwrap_or(!meshlight_core::address::is_group(destination)) {
        let ack_wait = core.config().router.ack_timeout();
        print_statuses(&mut events, ack_wait).await;
    }
    Ok(())
}

async fn cmd_get(core: &MeshCore, input: &str) -> Result<()> {
    let destination = target(input)?;
    prepare(core).await?;
    let mut events = core.subscribe();

    let delivery = core.get_state(destination).await?;
    print_delivery(destination, delivery);
    if delivery.is_sent() {
        let ack_wait = core.config().router.ack_timeout();
        print_statuses(&mut events, ack_wait).await;
    }
    Ok(())
}

async fn cmd_trigger(core: &MeshCore, input: &str, options: TriggerOptions) -> Result<()> {
    let destination = target(input)?;
    prepare(core).await?;

    match core.trigger(destination, true, options).await? {
        TriggerOutcome::Success { responders } => println!(
            "  {} {} completed ({} device(s))",
            "✓".green(),
            format_address(destination),
            responders
        ),
        TriggerOutcome::Partial {
            responders,
            expected,
        } => println!(
            "  {} {} partial: {} of {} device(s)",
            "!".yellow(),
            format_address(destination),
            responders,
            if expected == 0 {
                "?".to_string()
            } else {
                expected.to_string()
            }
        ),
        TriggerOutcome::TransportUnavailable => println!(
            "  {} {} no transport available",
            "✗".red(),
            format_address(destination)
        ),
    }
    Ok(())
}

/// Print status reports until `quiet` passes without one
async fn print_statuses(events: &mut broadcast::Receiver<CoreEvent>, quiet: Duration) {
    while let Ok(Ok(event)) = tokio::time::timeout(quiet, events.recv()).await {
        if let CoreEvent::Status(status) = event {
            println!(
                "  {} is {}",
                format!("0x{:04X}", status.source).bright_cyan(),
                state_label(status.state)
            );
        }
    }
}

async fn cmd_monitor(core: &MeshCore, duration: Option<Duration>) -> Result<()> {
    prepare(core).await?;
    let mut events = core.subscribe();
    println!("{}", "Monitoring (Ctrl-C to stop)".bold());

    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
    loop {
        let stop = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stop => break,
            event = events.recv() => event,
        };
        match event {
            Ok(CoreEvent::Status(status)) => println!(
                "  {} {} is {}",
                "●".bright_cyan(),
                format!("0x{:04X}", status.source),
                state_label(status.state)
            ),
            Ok(CoreEvent::ProxyReady { address }) => {
                println!("  {} proxy {} ready", "✓".green(), address)
            }
            Ok(CoreEvent::ProxyFailed { reason }) => {
                println!("  {} proxy link lost: {}", "✗".red(), reason)
            }
            Ok(CoreEvent::ProxyDisconnected) => println!("  {} proxy disconnected", "-".dimmed()),
            Ok(CoreEvent::FallbackEngaged) => {
                println!("  {} using direct GATT control", "!".yellow())
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                println!("  {} missed {} event(s)", "!".yellow(), n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

async fn cmd_devices(core: &MeshCore) -> Result<()> {
    prepare(core).await?;
    let devices = core.registry().devices();
    if devices.is_empty() {
        println!("{}", "No devices found.".dimmed());
        return Ok(());
    }

    println!("{}", format!("Devices ({})", devices.len()).bold());
    for device in devices {
        println!(
            "  {}  {}  {:<16}  group {}  {}  {}",
            format!("0x{:04X}", device.unicast).bright_cyan(),
            device
                .hardware
                .map(|hw| hw.to_string())
                .unwrap_or_else(|| "??:??:??:??:??:??".to_string()),
            device.name.as_deref().unwrap_or("-"),
            device
                .group
                .map(|g| format!("0x{:04X}", g))
                .unwrap_or_else(|| "-".to_string()),
            device
                .state
                .map(state_label)
                .unwrap_or_else(|| "?".dimmed()),
            device
                .battery
                .map(|b| format!("{}%", b))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

async fn cmd_groups(core: &MeshCore) -> Result<()> {
    prepare(core).await?;
    let registry = core.registry();
    let groups = registry.groups();
    if groups.is_empty() {
        println!("{}", "No groups known.".dimmed());
        return Ok(());
    }

    println!("{}", format!("Groups ({})", groups.len()).bold());
    for group in groups {
        let members: Vec<String> = registry
            .members_of(group.id)
            .iter()
            .map(|d| format!("0x{:04X}", d.unicast))
            .collect();
        println!(
            "  {}  {:<12}  {}",
            format!("0x{:04X}", group.id).bright_yellow(),
            group.name,
            if members.is_empty() {
                "(empty)".to_string()
            } else {
                members.join(", ")
            }
        );
    }
    Ok(())
}

fn cmd_config(action: &ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::Config::load(path)?;
            println!("{} {}", "Configuration".bold(), path.display().to_string().dimmed());
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            config::Config::default().save(path)?;
            println!("  {} Wrote {}", "✓".green(), path.display());
            println!(
                "  Next: {}",
                "meshlight config set net_key <32 hex digits>".bright_green()
            );
        }
        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load(path)?;
            config.set(key, value)?;
            config.save(path)?;
            println!("  {} {} updated", "✓".green(), key);
        }
    }
    Ok(())
}
