use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::op::{Op, OpContext};
use cli::ops::Command;

#[derive(Parser, Debug)]
#[command(name = "sigmad", version, about = "sigmaP file server and client")]
struct Args {
    /// State directory (defaults to the platform config dir)
    #[arg(long, global = true, env = "SIGMAD_DIR")]
    config_path: Option<PathBuf>,

    /// Server to talk to (defaults to the configured listen address)
    #[arg(long, global = true, env = "SIGMAD_ADDR")]
    addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

/// The service logs at its configured level, client commands only warn
fn default_level(args: &Args) -> String {
    match &args.command {
        Command::Serve(serve) => serve
            .config(args.config_path.clone())
            .map(|c| c.log_level)
            .unwrap_or_else(|_| "info".to_string()),
        _ => "warn".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(&args)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing setup: {e}"))?;

    let ctx = OpContext::new(args.config_path, args.addr);
    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}
