//! tally-ctl: command-line client for the Tally server.

use std::net::SocketAddr;

use anyhow::{Context, Result};

use tally_core::config::DEFAULT_PORT;
use tally_services::Client;

mod cmd;

use cmd::request::{Command, execute, print_help};

fn print_usage() {
    println!("Usage: tally-ctl [--server <host:port>] [command]");
    println!();
    println!("Commands:");
    print_help();
    println!();
    println!("With no command, an interactive prompt is started.");
    println!();
    println!("Options:");
    println!(
        "  --server <host:port>   Server address (default: 127.0.0.1:{})",
        DEFAULT_PORT
    );
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("cannot resolve {server}"))?
        .next()
        .with_context(|| format!("no address for {server}"))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --server option
    let mut server = format!("127.0.0.1:{DEFAULT_PORT}");
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--server" {
            i += 1;
            server = args.get(i).context("--server requires a value")?.clone();
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    if matches!(remaining.as_slice(), ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }

    let addr = resolve(&server).await?;
    let mut client = Client::connect(addr)
        .await
        .with_context(|| format!("failed to open socket for {addr}"))?;

    if remaining.is_empty() {
        return cmd::interactive::run(&mut client).await;
    }

    let command = match Command::parse(&remaining) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };
    execute(&mut client, &command)
        .await
        .with_context(|| format!("request to {addr} failed"))?;
    Ok(())
}
