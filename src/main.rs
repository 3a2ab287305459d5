//! # rudt - Demonstration Tools Entry Point
//!
//! Dispatches the demo tools over the transport library:
//! - `send-file`: stream a file to the peer (direct UDP or ICE);
//! - `recv-file`: accept connections and write incoming files to disk;
//! - `screen-serve`: answer screen-capture negotiations.
//!
//! Startup follows the same shape for every tool:
//! 1. parse arguments (they control logging before anything else runs);
//! 2. install the layered tracing subscriber: a detailed file (or stderr)
//!    layer plus a colorized user-facing stdout layer;
//! 3. start the transport runtime, run the tool, and tear the runtime
//!    down on the way out.
//!
//! Exit code 0 on normal completion or `--help`; nonzero on malformed
//! arguments or unrecoverable I/O.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use rudt::cli::{Args, Command};
use rudt::framing;
use rudt::{OptValue, SockOpt, SocketType, Transport};

mod logging;
use logging::ConsoleFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Verbosity: default INFO, -v DEBUG, -vv and more TRACE.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed layer: stderr on request, otherwise a rolling file. The
    // guard must outlive the program for file logging to flush.
    let guard;
    let detailed_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let path = Path::new(path_str);
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let file = path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("rudt.log"));
                tracing_appender::rolling::daily(dir, file)
            }
            None => tracing_appender::rolling::daily(".", "rudt.log"),
        };
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // User-facing stdout layer, silenced by --quiet.
    let stdout_layer = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ConsoleFormat::new())
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();
    let _log_guard = guard;

    let transport = rudt::startup();
    let result = run(transport, args.command).await;
    rudt::cleanup().await;
    if let Err(ref e) = result {
        error!("{e:#}");
    }
    result
}

async fn run(transport: Arc<Transport>, command: Command) -> Result<()> {
    match command {
        Command::SendFile { file, peer, stun, turn, monitor } => {
            send_file(transport, file, peer, stun, turn, monitor).await
        }
        Command::RecvFile { output, listen, stun, turn } => {
            recv_file(transport, output, listen, stun, turn).await
        }
        Command::ScreenServe { listen, stun, turn } => {
            screen_serve(transport, listen, stun, turn).await
        }
    }
}

/// Applies the STUN/TURN flags and performs the ICE credential exchange
/// over stdout/stdin, leaving the socket ready to connect or listen.
async fn setup_ice(
    transport: &Transport,
    sock: u32,
    stun: Option<String>,
    turn: Option<String>,
) -> Result<()> {
    if let Some(stun) = stun {
        transport
            .set_opt(sock, SockOpt::IceStunServer, OptValue::Str(stun.clone()))
            .map_err(|_| anyhow!("invalid STUN server specification: {stun}"))?;
    }
    if let Some(turn) = turn {
        transport
            .set_opt(sock, SockOpt::IceTurnServer, OptValue::Str(turn.clone()))
            .map_err(|_| anyhow!("invalid TURN relay specification: {turn}"))?;
    }
    transport.bind_ice(sock).await?;

    let (ufrag, pwd, candidates) = transport.get_ice_info(sock).await?;
    // The credential line is protocol, not logging; always print it.
    println!("{}", framing::format_ice_line(&ufrag, &pwd, &candidates));
    println!("Paste remote ICE info (length-prefixed fields as printed above):");

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    let (r_ufrag, r_pwd, r_cands) = framing::parse_ice_line(line.trim())
        .ok_or_else(|| anyhow!("invalid remote ICE info format"))?;
    transport.set_ice_info(sock, &r_ufrag, &r_pwd, &r_cands).await?;
    Ok(())
}

/// Once-per-second transfer monitor, like the historical tools printed:
/// send rate, RTT, congestion window, pacing period, ACKs, NAKs.
fn spawn_monitor(transport: Arc<Transport>, sock: u32) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("SendRate(Mb/s)\tRTT(ms)\tCWnd\tPktSndPeriod(us)\tRecvACK\tRecvNAK");
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match transport.perfmon(sock) {
                Ok(perf) => {
                    info!(
                        "{:.2}\t\t{:.3}\t{}\t{:.2}\t\t\t{}\t{}",
                        perf.mbps_send_rate,
                        perf.ms_rtt,
                        perf.pkt_congestion_window,
                        perf.us_pkt_snd_period,
                        perf.pkt_recv_ack,
                        perf.pkt_recv_nak
                    );
                }
                Err(_) => break,
            }
        }
    })
}

async fn send_file(
    transport: Arc<Transport>,
    file: PathBuf,
    peer: Option<SocketAddr>,
    stun: Option<String>,
    turn: Option<String>,
    monitor: bool,
) -> Result<()> {
    let sock = transport.socket(SocketType::Stream);
    match peer {
        Some(addr) => {
            transport.connect(sock, Some(addr)).await?;
        }
        None => {
            setup_ice(&transport, sock, stun, turn).await?;
            transport.connect(sock, None).await?;
        }
    }
    info!("connected, sending {}", file.display());

    let monitor_task = monitor.then(|| spawn_monitor(transport.clone(), sock));
    let result = framing::send_file(&transport, sock, &file).await;
    if let Some(task) = monitor_task {
        task.abort();
    }
    transport.close(sock).await?;
    result?;
    info!("file sent successfully");
    Ok(())
}

async fn recv_file(
    transport: Arc<Transport>,
    output: PathBuf,
    listen: Option<SocketAddr>,
    stun: Option<String>,
    turn: Option<String>,
) -> Result<()> {
    let sock = transport.socket(SocketType::Stream);
    match listen {
        Some(addr) => {
            transport.bind(sock, addr).await?;
            transport.listen(sock, 8)?;
            info!(
                "listening on {}",
                transport
                    .local_addr(sock)?
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".into())
            );
            loop {
                let (conn, peer) = transport.accept(sock).await?;
                info!(
                    "new connection: {}",
                    peer.map(|a| a.to_string()).unwrap_or_else(|| "unknown".into())
                );
                let transport = transport.clone();
                let output = output.clone();
                tokio::spawn(async move {
                    match framing::recv_file(&transport, conn, &output).await {
                        Ok((name, bytes)) => info!(
                            "received file from client: {name} saved as {:?} ({bytes} bytes)",
                            output
                        ),
                        Err(e) => error!("receive failed: {e}"),
                    }
                    let _ = transport.close(conn).await;
                });
            }
        }
        None => {
            setup_ice(&transport, sock, stun, turn).await?;
            transport.listen(sock, 1)?;
            let (conn, _) = transport.accept(sock).await?;
            info!("new connection");
            let (name, bytes) = framing::recv_file(&transport, conn, &output).await?;
            info!("received file from client: {name} saved as {output:?} ({bytes} bytes)");
            transport.close(conn).await?;
            transport.close(sock).await?;
            Ok(())
        }
    }
}

async fn screen_serve(
    transport: Arc<Transport>,
    listen: Option<SocketAddr>,
    stun: Option<String>,
    turn: Option<String>,
) -> Result<()> {
    let sock = transport.socket(SocketType::Stream);
    let single_shot = listen.is_none();
    match listen {
        Some(addr) => {
            transport.bind(sock, addr).await?;
            transport.listen(sock, 8)?;
            info!(
                "listening on {}",
                transport
                    .local_addr(sock)?
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".into())
            );
        }
        None => {
            setup_ice(&transport, sock, stun, turn).await?;
            transport.listen(sock, 1)?;
        }
    }

    loop {
        let (conn, _) = transport.accept(sock).await?;
        let neg = framing::read_negotiation(&transport, conn).await?;
        info!(
            "negotiated encoder: {}",
            if neg.encoder.is_empty() { "unknown" } else { &neg.encoder }
        );
        if !neg.caps.is_empty() {
            info!("received caps: {}", neg.caps);
        }
        // This tool carries no decode pipeline, so every offer is declined
        // with "no suitable sink".
        framing::send_status(&transport, conn, framing::STATUS_NO_SINK).await?;
        transport.close(conn).await?;
        if single_shot {
            transport.close(sock).await?;
            return Ok(());
        }
    }
}
