//! `arbiter-cli` – command selector entry point.
//!
//! This binary starts the vehicle command selector.  It:
//!
//! 1. Loads `~/.arbiter/config.toml` (defaults when absent) and applies
//!    `ARBITER_*` overrides.
//! 2. Wires the event bus, the selector service and the WebSocket command
//!    bridge together on a multi-threaded Tokio runtime.
//! 3. Reports authority and link changes on the console until **Ctrl-C**,
//!    then shuts the selector down cleanly.
//!
//! Exit code 1 means the configuration was invalid or the bridge could not
//! bind its address.

mod config;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use arbiter_kernel::LinkHealth;
use arbiter_middleware::{BusGateway, CommandBridge, EventBus};
use arbiter_runtime::{SelectorConfig, SelectorService, SelectorStatus};
use arbiter_types::ArbiterError;

fn main() -> ExitCode {
    let _guard = arbiter_runtime::init_tracing("arbiter");

    print_banner();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => return fail(&e),
    };
    let selector_config = match cfg.selector_config() {
        Ok(sc) => sc,
        Err(e) => return fail(&e),
    };
    let addr = match cfg.bridge_socket_addr() {
        Ok(addr) => addr,
        Err(e) => return fail(&e),
    };
    println!(
        "  Config: {}",
        config::config_path().display().to_string().bold()
    );
    println!(
        "  Watchdog: tick {} ms, timeout {} ms",
        cfg.tick_period_ms, cfg.heartbeat_timeout_ms
    );

    // ── Shutdown signal ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let trigger = Arc::clone(&shutdown_tx);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down the selector …".yellow().bold());
        let _ = trigger.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process with a signal instead");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => return fail(&ArbiterError::Channel(format!("failed to start runtime: {e}"))),
    };

    let result = runtime.block_on(run(selector_config, addr, shutdown_rx));
    drop(shutdown_tx);

    match result {
        Ok(()) => {
            println!("{}", "  ✓ Selector stopped.".green());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

async fn run(
    selector_config: SelectorConfig,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ArbiterError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ArbiterError::Channel(format!("ws bind error on {addr}: {e}")))?;

    let bus = Arc::new(EventBus::default());
    let gateway = Arc::new(BusGateway::new(Arc::clone(&bus)));
    let selector = SelectorService::spawn(selector_config, gateway);

    let bridge = CommandBridge::new(Arc::clone(&bus), selector.ingress());
    let bridge_task = tokio::spawn(bridge.serve(listener));

    info!(%addr, "arbiter ready");
    println!("  Bridge listening on {}", format!("ws://{addr}").bold().cyan());
    println!();

    let mut status = selector.status();
    let mut last = status.borrow_and_update().clone();
    report(None, &last);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("selector status channel closed");
                    break;
                }
                let next = status.borrow_and_update().clone();
                report(Some(&last), &next);
                last = next;
            }
        }
    }

    bridge_task.abort();
    selector.shutdown();
    selector.join().await
}

/// Print authority or link changes between two status snapshots.
fn report(previous: Option<&SelectorStatus>, current: &SelectorStatus) {
    if previous.map(|p| p.mode) != Some(current.mode) {
        println!("  Authority: {}", current.mode.to_string().bold());
    }
    if previous.map(|p| p.link) != Some(current.link) && current.link == LinkHealth::Failsafe {
        println!(
            "{}",
            "  ✗ Remote link lost – autonomous authority, emergency stop latched"
                .red()
                .bold()
        );
    }
}

fn fail(err: &ArbiterError) -> ExitCode {
    eprintln!("{}: {}", "Error".red().bold(), err);
    ExitCode::FAILURE
}

fn print_banner() {
    println!();
    println!("{}", r#"   ___       __    _ __         "#.bold().cyan());
    println!("{}", r#"  / _ | ____/ /_  (_) /____ ____"#.bold().cyan());
    println!("{}", r#" / __ |/ __/ _ \/ / __/ -_) __/"#.bold().cyan());
    println!("{}", r#"/_/ |_/_/ /_.__/_/\__/\__/_/   "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Arbiter".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Manual / autonomous command selector");
    println!();
}
