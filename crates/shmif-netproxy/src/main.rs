// SPDX-License-Identifier: Apache-2.0 OR MIT

//! shmif-netproxy CLI
//!
//! Bridges a local SHMIF segment to a remote peer over an a12 transport.
//!
//! # Usage
//!
//! ```bash
//! # Forward-local server mode: open a connpoint, dial out on each client
//! shmif-netproxy -s mycp example.org 6680
//!
//! # Inbound server: accept TCP, spawn a local client on each connection
//! shmif-netproxy -l 6680 -exec /usr/libexec/arcan_frameserver_decode
//!
//! # Record a keystore tag
//! shmif-netproxy keystore peer1 example.org 6680
//! ```

use clap::{Parser, Subcommand};
use shmif_netproxy::{
    DispatchMode, ExecSpec, Keystore, MagicPreambleHandshake, NetproxyHost, NoPrivilegeSeparation,
    ProxyConfig, ProxyMode, RetryPolicy, RunOptions,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shmif-netproxy")]
#[command(about = "Bridge a local SHMIF segment to a remote peer over a12")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Forward-local server mode: CONNPOINT HOST PORT
    #[arg(short = 's', num_args = 3, value_names = ["CONNPOINT", "HOST", "PORT"])]
    srv: Option<Vec<String>>,

    /// Inherited-socket variant: FD HOST PORT
    #[arg(short = 'S', num_args = 3, value_names = ["FD", "HOST", "PORT"])]
    srv_inherit: Option<Vec<String>>,

    /// Inbound server mode: PORT [HOST]
    #[arg(short = 'l', num_args = 1..=2, value_names = ["PORT", "HOST"])]
    listen: Option<Vec<String>>,

    /// Binary (and arguments) to exec as the local client on each
    /// accepted CL connection.
    #[arg(long = "exec", num_args = 1..)]
    exec: Option<Vec<String>>,

    /// Single-client dispatch (no fork per connection)
    #[arg(short = 't')]
    single_client: bool,

    /// Retry-connect attempt count (negative = forever)
    #[arg(short = 'r', long = "retry")]
    retry: Option<i64>,

    /// Trace bitmap (decimal or comma-separated group names) — forwarded
    /// to the log filter.
    #[arg(short = 'd')]
    trace: Option<String>,

    /// Disable exit-redirect to ARCAN_CONNPATH
    #[arg(short = 'X')]
    no_exit_redirect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a tag -> host[:port] mapping in the keystore.
    Keystore {
        tag: String,
        host: String,
        port: Option<u16>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = args.trace.clone().unwrap_or_else(|| args.log_level.clone());
    let filter = EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Some(Commands::Keystore { tag, host, port }) = args.command {
        let statepath = ProxyConfig::default()
            .resolve_statepath()
            .unwrap_or_else(|| "/tmp/arcan-state".to_string());
        let mut store = Keystore::open(&statepath)?;
        store.put(&tag, &host, port)?;
        println!("recorded {tag} -> {host}:{}", port.unwrap_or(6680));
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };

    let mode = build_mode(&args)?;
    let dispatch_mode = if args.single_client || config.single_client {
        DispatchMode::Single
    } else {
        DispatchMode::Fork
    };
    let retry_count = args.retry.unwrap_or(config.retry_count);

    let host = NetproxyHost;
    let auth = MagicPreambleHandshake;
    let privsep = NoPrivilegeSeparation;
    let opts = RunOptions { dispatch: dispatch_mode, retry: RetryPolicy::new(retry_count) };

    shmif_netproxy::modes::run(mode, opts, &host, &auth, &privsep)?;
    Ok(())
}

fn build_mode(args: &Args) -> anyhow::Result<ProxyMode> {
    if let Some(srv) = &args.srv {
        let [connpoint, remote_host, port] = srv.as_slice() else {
            anyhow::bail!("-s expects CONNPOINT HOST PORT");
        };
        return Ok(ProxyMode::Srv {
            connpoint: connpoint.clone(),
            remote_host: remote_host.clone(),
            remote_port: port.parse()?,
        });
    }

    if let Some(srv_inherit) = &args.srv_inherit {
        let [fd, remote_host, port] = srv_inherit.as_slice() else {
            anyhow::bail!("-S expects FD HOST PORT");
        };
        return Ok(ProxyMode::SrvInherit {
            inherited_fd: fd.parse()?,
            remote_host: remote_host.clone(),
            remote_port: port.parse()?,
        });
    }

    if let Some(listen) = &args.listen {
        let port: u16 = listen[0].parse()?;
        let bind_host = listen.get(1).cloned();
        let exec = args.exec.as_ref().map(|argv| ExecSpec {
            path: PathBuf::from(&argv[0]),
            args: argv[1..].to_vec(),
        });
        return Ok(ProxyMode::Cl { listen_port: port, bind_host, exec });
    }

    anyhow::bail!("one of -s, -S, or -l is required")
}
