//! Stand-in for the RDFox executable, used by the test suite.
//!
//! `stub-rdfox sandbox <ROOT> <COMMAND>...` runs each command (typically
//! `exec __master.rdfox`), then keeps reading commands from stdin until EOF,
//! like the RDFox shell. `stub-rdfox serve-dir` serves the current directory
//! over HTTP and prints the bound port.

mod query;
mod script;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::script::{Flow, Shell};

#[derive(Parser)]
#[command(name = "stub-rdfox", about = "Minimal RDFox stand-in for tests")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run shell commands with ROOT as the working directory.
    Sandbox {
        root: PathBuf,
        commands: Vec<String>,
    },
    /// Serve the working directory as static files.
    ServeDir {
        /// Address to bind the server to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on (0 picks a free one)
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STUB_RDFOX_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.mode {
        Mode::Sandbox { root, commands } => sandbox(root, commands).await?,
        Mode::ServeDir { bind, port } => serve_dir(&bind, port).await?,
    };
    std::process::exit(code);
}

async fn sandbox(root: PathBuf, commands: Vec<String>) -> Result<i32> {
    std::env::set_current_dir(&root)
        .with_context(|| format!("enter sandbox {}", root.display()))?;
    let mut shell = Shell::new();

    for command in &commands {
        match shell.execute(command).await {
            Flow::Exit(code) => return Ok(code),
            Flow::Continue | Flow::Failed => {}
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        if let Flow::Exit(code) = shell.execute(&line).await {
            return Ok(code);
        }
    }
    info!(serving = shell.serving(), "stdin closed, exiting");
    Ok(0)
}

async fn serve_dir(bind: &str, port: u16) -> Result<i32> {
    let root = std::env::current_dir().context("current dir")?;
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let port = listener.local_addr()?.port();
    println!("Serving directory {} on port {port}", root.display());

    let app = server::static_router(root);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tokio::select! {
        served = axum::serve(listener, app) => served.context("serve")?,
        // Exit when the supervisor closes stdin.
        _ = async { while let Ok(Some(_)) = lines.next_line().await {} } => {}
    }
    Ok(0)
}
