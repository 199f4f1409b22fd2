//! `rtbus-cli` – rtbus Command Line Interface
//!
//! Entry point for trying the bus out on a workstation.  It:
//!
//! 1. Loads `~/.rtbus/config.toml` (defaults when absent) and applies
//!    `RTBUS_*` environment overrides.
//! 2. Runs the demo system (sensor, controller, motor) for the configured
//!    time and prints topic, service and contract figures.
//! 3. Intercepts **Ctrl-C** to stop every node and report early.
//!
//! # Commands
//!
//! | Command | Effect |
//! |---|---|
//! | `rtbus run` | Run the demo system (default). |
//! | `rtbus init` | Write the default config file. |
//! | `rtbus config` | Print the effective configuration. |
//! | `rtbus schema` | Print the JSON schema of the config file. |

mod config;
mod demo;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

fn main() {
    let telemetry = rtbus_runtime::init_tracing("rtbus");

    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    let code = match command.as_str() {
        "run" => cmd_run(),
        "init" => cmd_init(),
        "config" => cmd_config(),
        "schema" => cmd_schema(),
        "help" | "-h" | "--help" => {
            print_help();
            0
        }
        other => {
            println!("{}: unknown command `{}`", "Error".red(), other);
            print_help();
            2
        }
    };

    drop(telemetry);
    std::process::exit(code);
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_run() -> i32 {
    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping nodes …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not stop the nodes cleanly");
    }

    let cfg = effective_config();
    println!(
        "  Running sensor → controller → motor for {}s (order {:?}, period {} ms)\n",
        cfg.demo.run_secs.to_string().bold(),
        cfg.bus.message_order,
        cfg.demo.publish_period_ms
    );

    match demo::run(&cfg, Duration::from_secs(cfg.demo.run_secs), &shutdown) {
        Ok(report) => {
            print_report(&report);
            if report.status.is_ok() { 0 } else { 1 }
        }
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            1
        }
    }
}

fn cmd_init() -> i32 {
    let path = config::config_path();
    if path.exists() {
        println!("  Config already exists at {}", path.display().to_string().bold());
        return 0;
    }
    match config::save(&config::Config::default()) {
        Ok(()) => {
            println!(
                "  {} Config saved to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            0
        }
        Err(e) => {
            println!("{}: {}", "Error saving config".red(), e);
            1
        }
    }
}

fn cmd_config() -> i32 {
    let cfg = effective_config();
    match toml::to_string_pretty(&cfg) {
        Ok(raw) => {
            println!("# {}", config::config_path().display());
            print!("{}", raw);
            0
        }
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            1
        }
    }
}

fn cmd_schema() -> i32 {
    match config::schema_json() {
        Ok(schema) => {
            println!("{}", schema);
            0
        }
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            1
        }
    }
}

/// Config file (or defaults) with environment overrides applied.
fn effective_config() -> config::Config {
    let mut cfg = match config::load() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => config::Config::default(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_report(report: &demo::DemoReport) {
    println!("{}", "  Topic".bold().cyan());
    println!(
        "    published {}   dropped {}   overwritten unread {}",
        report.published, report.dropped, report.topic.discarded
    );
    println!(
        "    slot utilisation {:?}",
        report.topic.utilizations
    );
    println!("{}", "  Controller".bold().cyan());
    println!(
        "    readings {}   contract violations {}",
        report.received,
        if report.violations == 0 {
            "0".green()
        } else {
            report.violations.to_string().yellow()
        }
    );
    println!("{}", "  Motor service".bold().cyan());
    println!(
        "    calls {}   answered {}   late {}",
        report.calls, report.answered, report.late
    );
    if let Some(service) = &report.service {
        println!("    ownership lost {}", service.ownership_lost);
    }
    println!();
    match &report.status {
        Ok(()) => println!("  {} Bus stopped cleanly.", "✓".green().bold()),
        Err(e) => {
            println!("  {} Bus failed: {}", "✗".red().bold(), e);
            if report.contract_broken {
                println!(
                    "  Raise `demo.hrt_deadline_ms` / `demo.service_deadline_ms` or the publish period."
                );
            }
        }
    }
}

fn print_help() {
    println!("Usage: rtbus [run | init | config | schema | help]");
    println!();
    println!("  run      Run the demo system (default)");
    println!("  init     Write the default config to ~/.rtbus/config.toml");
    println!("  config   Print the effective configuration");
    println!("  schema   Print the JSON schema of the config file");
}

fn print_banner() {
    println!();
    println!("{}", r#"        __  __              "#.bold().cyan());
    println!("{}", r#"   ____/ /_/ /_  __  _______"#.bold().cyan());
    println!("{}", r#"  / __/ __/ __ \/ / / / ___/"#.bold().cyan());
    println!("{}", r#" / / / /_/ /_/ / /_/ (__  ) "#.bold().cyan());
    println!("{}", r#"/_/  \__/_.___/\__,_/____/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "rtbus".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Real-time publish/subscribe and RPC bus");
    println!();
}
