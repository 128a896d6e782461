//! Warden - Entry Point
//!
//! Supervises one application process, redeploys it from git or a release
//! feed and serves its status and logs over a local HTTP API.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use colored::Colorize;
use tracing::{error, info};

use warden::app::options::AppOptions;
use warden::app::run::run;
use warden::deploy::fetcher;
use warden::deploy::identity::IdentityRecord;
use warden::logs::{init_logging, LogOptions};
use warden::storage::layout::StorageLayout;
use warden::storage::settings::Settings;
use warden::utils::version_info;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("settings") {
        Some(path) => warden::filesys::file::File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!(
                    "Unable to read settings file {}: {}",
                    settings_file.path().display(),
                    e
                );
                std::process::exit(1);
            }
        }
    } else {
        eprintln!(
            "No settings file at {}, using defaults",
            settings_file.path().display()
        );
        Settings::default()
    };

    // Settings may move the base directory unless the command line already did
    let layout = match (&settings.base_dir, cli_args.contains_key("base-dir")) {
        (Some(dir), false) => StorageLayout::new(dir),
        _ => layout,
    };

    // Check the configuration and exit
    if cli_args.contains_key("check") {
        let ok = run_check(&settings, &layout).await;
        std::process::exit(if ok { 0 } else { 1 });
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(&settings, layout);
    info!("Running warden {} with options: {:?}", version.version, options);
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run warden: {e}");
        std::process::exit(1);
    }
}

/// Print a readable report of the configuration and local state
async fn run_check(settings: &Settings, layout: &StorageLayout) -> bool {
    let mut ok = true;
    let pass = |label: &str, detail: String| println!("{} {}: {}", "ok".green().bold(), label, detail);
    let fail = |label: &str, detail: String| println!("{} {}: {}", "FAIL".red().bold(), label, detail);

    println!("{}", "warden configuration check".bold());
    println!("base directory: {}", layout.base_dir.display());

    match layout.setup().await {
        Ok(()) => pass("storage", "directories are writable".to_string()),
        Err(e) => {
            fail("storage", e.to_string());
            ok = false;
        }
    }

    match fetcher::from_settings(&settings.source, layout.artifacts_dir()) {
        Ok(fetcher) => match fetcher.latest_version().await {
            Ok(version) => pass("source", format!("{} at {}", fetcher.describe(), version)),
            Err(e) => {
                fail("source", format!("{}: {}", fetcher.describe(), e));
                ok = false;
            }
        },
        Err(e) => {
            fail("source", e.to_string());
            ok = false;
        }
    }

    match which(&settings.service.command) {
        Some(path) => pass("command", path.display().to_string()),
        None => {
            fail("command", format!("'{}' not found", settings.service.command));
            ok = false;
        }
    }

    match IdentityRecord::new(layout.identity_file()).load().await {
        Ok(Some(identity)) => pass("process", format!("PID {} recorded", identity.pid)),
        Ok(None) => pass("process", "none recorded".to_string()),
        Err(e) => {
            fail("process", e.to_string());
            ok = false;
        }
    }

    match &settings.health.url {
        Some(url) => pass("health", url.to_string()),
        None => println!("{} health: no endpoint, process checks only", "warn".yellow().bold()),
    }

    ok
}

fn which(command: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|path| path.is_file())
    })
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            error!("Failed to install signal handlers, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
