mod cli;
mod config;
mod core;
mod interfaces;
mod logging;
mod worker;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_main().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
