mod daemon;

use anyhow::{Result, bail};

use crate::worker::WorkerArgs;

fn print_help() {
    println!("plugdock - plugin worker orchestrator\n");
    println!("Usage: plugdock <command> [flags]\n");
    println!("Commands:");
    println!("  daemon   Run the orchestrator (scheduler, pool, gateway API)");
    println!("           --config <path>   config file (default: plugdock.toml)");
    println!("  worker   Run one plugin worker process (spawned by the daemon)");
    println!("           --org <id> --plugin <id> --port <port> [--test-mode]");
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("daemon") => daemon::run(parse_daemon_flags(&args, 2)).await,
        Some("worker") => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "info".into()),
                )
                .init();
            let worker_args = parse_worker_flags(&args, 2)?;
            let code = crate::worker::run(worker_args).await;
            std::process::exit(code);
        }
        _ => {
            print_help();
            Ok(())
        }
    }
}

pub(crate) fn parse_daemon_flags(args: &[String], start: usize) -> daemon::DaemonFlags {
    let mut config_path = "plugdock.toml".to_string();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    daemon::DaemonFlags { config_path }
}

pub(crate) fn parse_worker_flags(args: &[String], start: usize) -> Result<WorkerArgs> {
    let mut organization_id = None;
    let mut plugin_id = None;
    let mut port = None;
    let mut test_mode = false;

    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--org" => {
                if i + 1 < args.len() {
                    organization_id = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--plugin" => {
                if i + 1 < args.len() {
                    plugin_id = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--test-mode" => {
                test_mode = true;
                i += 1;
            }
            _ => i += 1,
        }
    }

    let Some(organization_id) = organization_id else {
        bail!("worker requires --org <id>");
    };
    let Some(plugin_id) = plugin_id else {
        bail!("worker requires --plugin <id>");
    };
    let Some(port) = port else {
        bail!("worker requires --port <port>");
    };
    Ok(WorkerArgs {
        organization_id,
        plugin_id,
        port,
        test_mode,
    })
}
