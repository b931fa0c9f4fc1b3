// Copyright 2026 The dutctl Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client entry point: connects to a `dutctld` agent and drives one
//! command's run to completion. Output formatting (human/JSON/YAML) and
//! the simple non-streaming RPCs (`List`, `Commands`, `Details`) are out
//! of core scope; this binary prints raw `Print`/console bytes and
//! supports only the run-stream path.
//!
//! The command-line surface is positional rather than subcommand-keyword
//! based: `dutctl <device> <command> [args...]`, `dutctl <device> <command>
//! help`, `dutctl list`, `dutctl version`. `Commands::Invoke` is a clap
//! external subcommand so `device`/`command` names never collide with the
//! two reserved words.

use std::{io, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use libdutctl::{client, stream::ClientStream, transport::TcpClientStream};
use tracing::error;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[clap(author, about = "Issues commands against devices hosted by a dutctld agent")]
struct Args {
    #[clap(
        short,
        long,
        default_value = "127.0.0.1:7827",
        help = "Address of the dutctld agent to connect to"
    )]
    addr: String,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    verbose: u8,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "List devices known to the agent (not supported by this transport)")]
    List,

    /// Everything else: `<device> <command> [args...]` or `<device>
    /// <command> help`.
    #[clap(external_subcommand)]
    Invoke(Vec<String>),
}

fn main() {
    let args = Args::parse();

    if let Commands::Version = args.command {
        println!("dutctl {VERSION}");
        return;
    }

    init_logging(args.verbose);

    if let Err(e) = run(args) {
        error!("{e:?}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Commands::Version => unreachable!("handled before logging init"),
        Commands::List => {
            println!("list is served by a separate unary RPC not exposed over the run stream");
            Ok(())
        }
        Commands::Invoke(parts) => invoke(&args.addr, parts),
    }
}

fn invoke(addr: &str, parts: Vec<String>) -> anyhow::Result<()> {
    let mut it = parts.into_iter();
    let device = it.next().context("usage: dutctl <device> <command> [args...]")?;
    let command = it.next().context("usage: dutctl <device> <command> [args...]")?;
    let rest: Vec<String> = it.collect();

    if rest.first().map(String::as_str) == Some("help") {
        println!("command details are served by a separate unary RPC not exposed over the run stream");
        return Ok(());
    }

    let stream =
        TcpClientStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    let stream: Arc<dyn ClientStream> = Arc::new(stream);
    client::run(
        stream,
        &device,
        &command,
        &rest,
        Box::new(io::stdout()),
        Box::new(io::stderr()),
        Box::new(io::stdin()),
    )
}
