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

//! Agent daemon entry point: loads the device registry, listens for run
//! streams on a TCP socket, and spawns a `Broker` + module pipeline per
//! accepted connection.

use std::{net::TcpListener, sync::Arc, thread};

use anyhow::Context;
use clap::Parser;
use libdutctl::{
    broker::{self, Broker},
    config, pipeline,
    registry::Registry,
    transport::TcpAgentStream,
    RunContext, Session,
};
use tracing::{error, info, instrument, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[clap(author, about = "Agent daemon hosting devices and their commands")]
struct Args {
    #[clap(short, long, help = "TOML file declaring devices, commands, and their module pipelines")]
    config: String,

    #[clap(
        short,
        long,
        default_value = "127.0.0.1:7827",
        help = "Address to listen for run connections on"
    )]
    listen: String,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    verbose: u8,

    #[clap(long, help = "Print version and exit")]
    version: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version {
        println!("dutctld {VERSION}");
        return Ok(());
    }

    init_logging(args.verbose);

    let registry = config::load_file(std::path::Path::new(&args.config))
        .with_context(|| format!("loading device registry from {}", args.config))?;
    let registry = Arc::new(registry);

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("binding listen address {}", args.listen))?;
    info!(addr = %args.listen, "dutctld listening");

    for conn in listener.incoming() {
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let registry = registry.clone();
        thread::spawn(move || {
            if let Err(e) = handle_connection(conn, &registry) {
                error!(error = %e, "run failed");
            }
        });
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_thread_ids(true)
        .with_target(false)
        .init();
}

/// Services exactly one run: reads the initiating `Command` request off the
/// raw connection, looks it up in the registry, then hands the stream to a
/// `Broker` and drives the command's module pipeline against the Session the
/// Broker exposes.
#[instrument(skip_all)]
fn handle_connection(conn: std::net::TcpStream, registry: &Registry) -> anyhow::Result<()> {
    conn.set_nodelay(true).ok();
    let stream = Arc::new(TcpAgentStream::new(conn)?);

    use libdutctl::stream::AgentStream;
    let request = stream.receive()?;
    let (device, command_name, args) = match request {
        Some(dutctl_protocol::RunRequest::Command { device, command, args }) => (device, command, args),
        Some(other) => anyhow::bail!("expected Command as first request, got {other:?}"),
        None => return Ok(()), // client hung up before sending anything
    };

    let command = match registry.command(&device, &command_name) {
        Some(c) => c,
        None => {
            stream.send(dutctl_protocol::RunResponse::Print {
                text: format!("unknown device/command: {device}/{command_name}\n").into_bytes(),
            })?;
            return Ok(());
        }
    };
    let steps = match pipeline::build_steps(command, &args) {
        Ok(steps) => steps,
        Err(e) => {
            stream.send(dutctl_protocol::RunResponse::Print {
                text: format!("{device}/{command_name}: {e}\n").into_bytes(),
            })?;
            return Ok(());
        }
    };

    let ctx = RunContext::new();
    let broker = Broker::new(ctx.clone());
    let (session, errors): (Arc<Session>, _) = broker.start(stream);

    let run_result = pipeline::run(&ctx, session.clone(), steps);
    session.wait_for_transfers();
    broker.shutdown();
    broker::drain_errors(&errors);

    if let Err(e) = run_result {
        warn!(device = %device, command = %command_name, error = %e, "module pipeline failed");
    }
    Ok(())
}
