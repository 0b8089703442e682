mod cli;

use crate::cli::configure_cli;
use env_logger::Env;
use log::{error, info};
use refit::config::load_config;
use refit::docker::DockerHandler;
use refit::report::SessionReport;
use refit::session::UpdateSession;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
#[allow(unused_imports)]
use std::{env, process};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    #[cfg(target_os = "linux")]
    set_group_id();

    let cli = configure_cli();
    let mut config = load_config(&cli.config_path)?;
    if cli.monitor_only {
        config.update.monitor_only = true;
    }
    let interval = cli.interval.or(config.schedule.interval);
    let options = config.update_options();

    #[cfg(feature = "chatterbox")]
    let dispatcher = refit::notifications::setup_dispatcher();

    info!("Starting refit");
    let cancelled = Arc::new(AtomicBool::new(false));
    let c = cancelled.clone();
    ctrlc::set_handler(move || {
        if c.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        info!("Received shutdown signal, finishing containers in flight...");
    })?;

    let runtime = Arc::new(DockerHandler::new()?);
    let mut failed;
    loop {
        let started = Instant::now();
        let session = UpdateSession::new(runtime.clone(), options.clone())
            .with_cancellation(cancelled.clone());
        match session.run().await {
            Ok(report) => {
                failed = report.has_failures();
                print_report(&report, cli.json)?;
                #[cfg(feature = "chatterbox")]
                refit::notifications::send_report(&report, &dispatcher);
            }
            Err(e) => {
                error!("update session failed: {e}");
                failed = true;
            }
        }

        let Some(interval) = interval else {
            break;
        };
        while !cancelled.load(Ordering::SeqCst)
            && started.elapsed() < Duration::from_secs(interval)
        {
            sleep(Duration::from_millis(500)).await;
        }
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
    }

    if failed {
        process::exit(1);
    }
    Ok(())
}

fn print_report(report: &SessionReport, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for record in report.changes() {
        info!("{record}");
    }
    if !report.cycle_members().is_empty() {
        info!("linked in a cycle: {:?}", report.cycle_members());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_group_id() {
    let docker_gid = env::var("DOCKER_GID").unwrap_or_else(|_| "999".to_string());
    let Ok(docker_gid) = docker_gid.parse::<u32>() else {
        error!("Invalid DOCKER_GID {docker_gid}, keeping the current group");
        return;
    };
    info!("Setting GID to {docker_gid}");
    // requires CAP_SETGID
    unsafe {
        if libc::setgid(docker_gid) != 0 {
            error!("Failed to set GID to {docker_gid}");
        }
    }
}
