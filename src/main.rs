mod cli;
mod signals;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{select, tick};
use log::{error, info};
use procwarden::config::{self, RestartPolicy, ServiceConfig};
use procwarden::{
    AutoRestarter, ServiceStatus, StartOutcome, StatusEvent, StopOutcome, Supervisor,
};

/// Lines of captured output shown when a service crashes.
const CRASH_TAIL_LINES: usize = 5;

fn main() {
    // Initialize logger with custom format for the supervisor
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    if let Err(e) = real_main() {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    let cfg_path = match args.config {
        Some(path) => path,
        None => config::default_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?,
    };
    let cfg = load_or_init(&cfg_path)?;
    let base_dir = config_base_dir(&cfg_path)?;
    info!("Using config from: {}", cfg_path.display());

    let supervisor =
        Supervisor::from_config(&cfg, &base_dir).context("Invalid service configuration")?;

    match args.sub.unwrap_or(cli::Cmd::Run { services: vec![] }) {
        cli::Cmd::Run { services } => handle_run(&supervisor, &cfg.supervisor.restart, &services),
        cli::Cmd::Status { json } => handle_status(&supervisor, json),
        cli::Cmd::Stop => handle_stop(&supervisor),
    }
}

/// Read the config, writing the defaults first if the file does not exist yet.
fn load_or_init(cfg_path: &Path) -> Result<ServiceConfig> {
    if !cfg_path.exists() {
        info!(
            "Config not found at {}, creating default configuration",
            cfg_path.display()
        );

        if let Some(parent) = cfg_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_toml = ServiceConfig::default()
            .to_toml()
            .context("Failed to serialize default config")?;
        fs::write(cfg_path, default_toml).context("Failed to write config file")?;

        info!("Created default configuration at {}", cfg_path.display());
    }

    ServiceConfig::load(cfg_path).context("Failed to load config")
}

fn config_base_dir(cfg_path: &Path) -> Result<PathBuf> {
    let dir = cfg_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::canonicalize(dir).with_context(|| format!("Failed to resolve {}", dir.display()))
}

/// Start services, then report transitions until nothing is left running or
/// a signal arrives.
fn handle_run(supervisor: &Supervisor, policy: &RestartPolicy, services: &[String]) -> Result<()> {
    if let Some(unknown) = services.iter().find(|name| !supervisor.contains(name)) {
        anyhow::bail!("unknown service '{unknown}'");
    }

    signals::install_signal_handlers()?;
    let events = supervisor.bus().subscribe_all();
    let _restarter = if policy.enabled {
        Some(AutoRestarter::attach(supervisor, policy.clone())?)
    } else {
        None
    };

    println!("Starting services...");
    let report = if services.is_empty() {
        supervisor.start_all()
    } else {
        supervisor.start_many(services)
    };
    for (name, result) in &report.results {
        match result {
            Ok(StartOutcome::Started { pid }) => println!("✓ {name} started (pid {pid})"),
            Ok(StartOutcome::AlreadyActive) => println!("✓ {name} already running"),
            Err(e) => println!("✗ {name}: {e}"),
        }
    }
    println!(
        "\nStarted {}/{} services",
        report.succeeded(),
        report.results.len()
    );
    if report.succeeded() == 0 {
        return Ok(());
    }
    println!("Supervising, press Ctrl-C to stop all services.");

    // with auto-restart on, a crashed service may come back after the delay
    let idle_grace = if policy.enabled {
        policy.delay() + Duration::from_millis(500)
    } else {
        Duration::ZERO
    };
    let mut idle_since: Option<Instant> = None;
    let sig_tick = tick(Duration::from_millis(200));

    loop {
        select! {
            recv(events.events) -> evt => {
                let Ok(evt) = evt else { break };
                print_event(supervisor, &evt);
            }
            recv(sig_tick) -> _ => {
                if let Some(sig) = signals::check_signals() {
                    info!("signal {sig:?}, shutting down");
                    println!("\nReceived {sig:?}, stopping all services...");
                    print_stop_report(supervisor);
                    return Ok(());
                }
                if supervisor.any_active() {
                    idle_since = None;
                } else {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= idle_grace {
                        break;
                    }
                }
            }
        }
    }

    // transitions still queued on the bus
    while let Ok(evt) = events.events.recv_timeout(Duration::from_millis(100)) {
        print_event(supervisor, &evt);
    }
    println!("All services have stopped, exiting.");
    Ok(())
}

fn print_event(supervisor: &Supervisor, evt: &StatusEvent) {
    println!("{}  {evt}", evt.ts.format("%H:%M:%S"));
    if evt.crash.is_some() {
        print_output_tail(supervisor, &evt.service);
    }
}

fn print_output_tail(supervisor: &Supervisor, service: &str) {
    let Ok(lines) = supervisor.recent_output(service) else {
        return;
    };
    let skip = lines.len().saturating_sub(CRASH_TAIL_LINES);
    for line in &lines[skip..] {
        println!("    | {line}");
    }
}

fn handle_status(supervisor: &Supervisor, json: bool) -> Result<()> {
    let snapshots = supervisor.snapshots();
    if json {
        let out = serde_json::to_string_pretty(&snapshots).context("Failed to encode status")?;
        println!("{out}");
        return Ok(());
    }

    println!("{:<25} {:<10} {:<8} EXECUTABLE", "SERVICE", "STATUS", "PID");
    println!("{}", "-".repeat(70));
    for snap in &snapshots {
        let pid = snap.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let missing = if snap.executable_exists { "" } else { " (missing)" };
        let marker = match snap.status {
            ServiceStatus::Running | ServiceStatus::Starting => "✓",
            ServiceStatus::Stopped | ServiceStatus::Error => "✗",
        };
        println!(
            "{:<25} {marker} {:<8} {pid:<8} {}{missing}",
            snap.name,
            snap.status,
            snap.executable.display()
        );
    }
    println!("{}", "-".repeat(70));
    Ok(())
}

fn handle_stop(supervisor: &Supervisor) -> Result<()> {
    println!("Stopping all services...");
    print_stop_report(supervisor);
    println!("All services stopped.");
    Ok(())
}

fn print_stop_report(supervisor: &Supervisor) {
    let report = supervisor.shutdown();
    for (name, result) in &report.results {
        match result {
            Ok(StopOutcome::AlreadyStopped) => println!("✓ {name} was not running"),
            Ok(StopOutcome::Stopped { forced: false }) => println!("✓ {name} stopped"),
            Ok(StopOutcome::Stopped { forced: true }) => {
                println!("✓ {name} stopped (killed after grace period)")
            }
            Err(e) => println!("✗ {name}: {e}"),
        }
    }
}
