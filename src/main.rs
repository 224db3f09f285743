//! routerfw - commit-confirm firewall daemon for small routers
//!
//! Serves the management API that the router dashboard uses to toggle the
//! firewall, edit port forwards, the blocklist and the DMZ host. Every change
//! is installed immediately and rolled back after 120 seconds unless it is
//! confirmed.
//!
//! # Usage
//!
//! ```bash
//! routerfw                         # Serve the API (same as `routerfw serve`)
//! routerfw --config /etc/routerfw/config.json serve
//! routerfw status                  # Show committed and pending state
//! routerfw rules --format nft      # Print the committed rule program
//! routerfw history -n 50          # Recent audit trail entries
//! routerfw recover                 # Undo an unconfirmed change and exit
//! routerfw init-config             # Write a default config file
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use routerfw::api::{self, ApiState};
use routerfw::audit::AuditLog;
use routerfw::config::{self, AppConfig};
use routerfw::core::applier::NftApplier;
use routerfw::core::compiler::compile;
use routerfw::core::firewall::{ConfigSnapshot, FirewallConfig, NetworkLayout};
use routerfw::core::session::{ChangeSession, RecoveryPolicy};
use routerfw::core::store::RuleStore;
use routerfw::utils;

shadow_rs::shadow!(build);

const DEFAULT_LOG_FILTER: &str = "routerfw=info,tower_http=info";
const LOG_FILE: &str = "routerfw.log";

#[derive(Parser)]
#[command(name = "routerfw")]
#[command(about = "Commit-confirm nftables manager for router firewalls", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Path to the config file (default: config.json in the config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the management API (default)
    Serve,
    /// Show the committed configuration and any pending change
    Status,
    /// Print the committed rule program
    Rules {
        #[arg(short, long, value_enum, default_value_t = RulesFormat::Nft)]
        format: RulesFormat,
    },
    /// Show recent entries from the audit trail
    History {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Revert a change left unconfirmed by a previous run, then exit
    Recover,
    /// Write a config file with every setting at its default
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RulesFormat {
    Nft,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let command = cli.command.unwrap_or(Commands::Serve);

    if let Commands::InitConfig { force } = command {
        return init_config(cli.config.as_deref(), force).await;
    }

    let config = config::load_config(cli.config.as_deref()).await?;

    match command {
        Commands::Serve => {
            init_logging(config.log_to_file.then(|| config.state_dir().join(LOG_FILE)));
            serve(config).await
        }
        Commands::Status => status(&config),
        Commands::Rules { format } => rules(&config, format),
        Commands::History { limit } => history(&config, limit).await,
        Commands::Recover => {
            init_logging(None);
            recover(config).await
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn init_logging(log_file: Option<PathBuf>) {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    if let Some(path) = log_file {
        let opened = path
            .parent()
            .map_or(Ok(()), utils::ensure_dir)
            .and_then(|()| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
            });
        match opened {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter())
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => eprintln!("Warning: cannot open log file {}: {e}", path.display()),
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter()).init();
}

async fn serve(config: AppConfig) -> Result<(), Box<dyn Error>> {
    info!(
        version = build::PKG_VERSION,
        commit = build::SHORT_COMMIT,
        "routerfw starting"
    );

    let layout = config.layout();
    warn_missing_interfaces(&layout);

    let store = RuleStore::open(config.state_dir())?;
    let applier = Arc::new(NftApplier::new(config.nft_options()));
    let session = ChangeSession::start(layout, store, applier, config.session_options()).await?;

    let app = api::router(ApiState::new(Arc::clone(&session)));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Management API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    session.shutdown().await?;
    info!("routerfw stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown requested");
}

fn warn_missing_interfaces(layout: &NetworkLayout) {
    let present = utils::list_interfaces();
    if present.is_empty() {
        return;
    }
    let configured = std::iter::once(&layout.wan_interface).chain(&layout.lan_interfaces);
    for iface in configured.filter(|i| !i.is_empty()) {
        if !present.contains(iface) {
            warn!(interface = %iface, "Configured interface does not exist on this host");
        }
    }
}

/// The committed snapshot, or what a first start would commit
fn active_snapshot(store: &RuleStore, layout: &NetworkLayout) -> Result<ConfigSnapshot, Box<dyn Error>> {
    if let Some(snapshot) = store.load_active()? {
        return Ok(snapshot);
    }
    let config = FirewallConfig::default();
    let rules = compile(&config, layout)?;
    Ok(ConfigSnapshot { config, rules })
}

fn status(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let layout = config.layout();
    let store = RuleStore::open(config.state_dir())?;
    let active = active_snapshot(&store, &layout)?;
    let firewall = &active.config;
    let policy = &firewall.policy;

    println!("State directory: {}", store.dir().display());
    println!(
        "Table: inet {}  WAN: {}  LAN: {}",
        layout.table,
        layout.wan_interface,
        layout.lan_interfaces.join(", ")
    );
    println!(
        "Firewall: {} (input {}, forward {}, output {})",
        if policy.enabled { "enabled" } else { "disabled" },
        policy.input_policy,
        policy.forward_policy,
        policy.output_policy
    );
    println!("Port forwards: {}", firewall.port_forwards.len());
    for forward in firewall.port_forwards.values() {
        println!(
            "  {} {} -> {}:{} {}",
            forward.protocol,
            forward.external_port,
            forward.internal_ip,
            forward.internal_port,
            forward.description
        );
    }
    println!("Blocked IPs: {}", firewall.blocked_ips.len());
    for blocked in firewall.blocked_ips.values() {
        println!("  {} {}", blocked.ip, blocked.description);
    }
    match (firewall.dmz.enabled, firewall.dmz.target_ip) {
        (true, Some(target)) => println!("DMZ: {target}"),
        _ => println!("DMZ: off"),
    }
    println!("Rules fingerprint: {}", active.rules.fingerprint());

    match store.load_pending()? {
        Some(change) => {
            println!();
            println!("Pending change: {} ({})", change.description, change.id);
            println!("  State: {}", change.state);
            println!("  Expires: {}", change.deadline().to_rfc3339());
            if let Some(diff) = change.after.rules.diff_from(&change.before.rules) {
                println!("{diff}");
            }
        }
        None => println!("No pending changes."),
    }
    Ok(())
}

fn rules(config: &AppConfig, format: RulesFormat) -> Result<(), Box<dyn Error>> {
    let store = RuleStore::open(config.state_dir())?;
    let active = active_snapshot(&store, &config.layout())?;
    match format {
        RulesFormat::Nft => print!("{}", active.rules.to_nft_text()),
        RulesFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&active.rules.to_nftables_json())?
        ),
    }
    Ok(())
}

async fn history(config: &AppConfig, limit: usize) -> Result<(), Box<dyn Error>> {
    let audit = AuditLog::new(&config.state_dir());
    let events = audit.recent(limit).await?;
    if events.is_empty() {
        println!("No audit entries in {}", audit.path().display());
        return Ok(());
    }

    for event in events {
        let change = event
            .change_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let description = event.details["description"].as_str().unwrap_or("");
        println!(
            "{}  {:<22} {:<4} {}  {}",
            event.at.format("%Y-%m-%d %H:%M:%S"),
            event.event.to_string(),
            if event.ok { "ok" } else { "FAIL" },
            change,
            description
        );
        if let Some(error) = event.error {
            println!("    {error}");
        }
    }
    Ok(())
}

async fn recover(config: AppConfig) -> Result<(), Box<dyn Error>> {
    let store = RuleStore::open(config.state_dir())?;
    let had_pending = store.load_pending()?.is_some();

    let mut options = config.session_options();
    // nothing would be left running to finish a resumed countdown
    options.recovery = RecoveryPolicy::Revert;

    let applier = Arc::new(NftApplier::new(config.nft_options()));
    let session = ChangeSession::start(config.layout(), store, applier, options).await?;

    let status = session.reporter().get_status();
    if had_pending {
        println!("✓ Pending change recovered.");
    } else {
        println!("✓ No pending change found.");
    }
    println!(
        "Firewall is {}.",
        if status.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn init_config(path: Option<&Path>, force: bool) -> Result<(), Box<dyn Error>> {
    let path = path.map_or_else(config::default_config_path, Path::to_path_buf);
    if !force && tokio::fs::try_exists(&path).await? {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    config::save_config(&AppConfig::default(), &path).await?;
    println!("✓ Wrote default configuration to {}", path.display());
    Ok(())
}
