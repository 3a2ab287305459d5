//! # Command-Line Interface Module
//!
//! Argument parsing for the demonstration tools, using the `clap` derive
//! API. The surface mirrors the historical tools: `--verbose`/`-v` and
//! `--quiet`/`-q` control output, `--help`/`-h` exits cleanly, and the ICE
//! server flags accept `--stun=HOST[:PORT]` and
//! `--turn=HOST[:PORT],USER,PASS`.
//!
//! Each tool runs either over a direct UDP channel (when a peer or listen
//! address is given) or over an ICE channel, in which case credentials and
//! candidates are exchanged as a single length-prefixed line on
//! stdout/stdin.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::channel::{RelayTransport, TurnRelay, DEFAULT_STUN_PORT};

/// Reliable datagram transport demonstration tools.
///
/// Without `--peer`/`--listen` the tools rendezvous over ICE: each side
/// prints its credential line and reads the peer's from stdin.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase diagnostic verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Silence user-facing output on stdout.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed log destination: a file path, or "stderr".
    #[arg(long, global = true)]
    pub log_file: Option<String>,

    /// Tool to run.
    #[command(subcommand)]
    pub command: Command,
}

/// The demonstration tools.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Send a file to the peer.
    SendFile {
        /// File to transmit.
        file: PathBuf,

        /// Connect directly to this UDP endpoint instead of using ICE.
        #[arg(long)]
        peer: Option<SocketAddr>,

        /// STUN server as HOST[:PORT].
        #[arg(long, value_name = "HOST[:PORT]")]
        stun: Option<String>,

        /// TURN relay as HOST[:PORT],USER,PASS.
        #[arg(long, value_name = "HOST[:PORT],USER,PASS")]
        turn: Option<String>,

        /// Print a once-per-second transfer monitor.
        #[arg(long)]
        monitor: bool,
    },

    /// Receive files and write them to disk.
    RecvFile {
        /// Output file name. The historical server always wrote
        /// "filetest" regardless of the transmitted name; this default
        /// preserves that behaviour.
        #[arg(long, default_value = "filetest")]
        output: PathBuf,

        /// Listen on this UDP endpoint instead of using ICE.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// STUN server as HOST[:PORT].
        #[arg(long, value_name = "HOST[:PORT]")]
        stun: Option<String>,

        /// TURN relay as HOST[:PORT],USER,PASS.
        #[arg(long, value_name = "HOST[:PORT],USER,PASS")]
        turn: Option<String>,
    },

    /// Answer screen-capture negotiations (no decode pipeline is built
    /// into this tool, so offers are declined with "no suitable sink").
    ScreenServe {
        /// Listen on this UDP endpoint instead of using ICE.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// STUN server as HOST[:PORT].
        #[arg(long, value_name = "HOST[:PORT]")]
        stun: Option<String>,

        /// TURN relay as HOST[:PORT],USER,PASS.
        #[arg(long, value_name = "HOST[:PORT],USER,PASS")]
        turn: Option<String>,
    },
}

/// Parses `HOST[:PORT]`, defaulting the port to 3478. Rejects empty hosts
/// and unparseable ports.
pub fn parse_host_port(spec: &str) -> Option<(String, u16)> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    match spec.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return None;
            }
            let port: u16 = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((spec.to_string(), DEFAULT_STUN_PORT)),
    }
}

/// Parses `HOST[:PORT],USER,PASS[,udp|tcp]` into a TURN relay
/// description. The relay transport defaults to UDP.
pub fn parse_turn_spec(spec: &str) -> Option<TurnRelay> {
    let mut parts = spec.split(',');
    let (host, port) = parse_host_port(parts.next()?)?;
    let username = parts.next()?.trim().to_string();
    let password = parts.next()?.trim().to_string();
    if username.is_empty() || password.is_empty() {
        return None;
    }
    let transport = match parts.next().map(|t| t.trim().to_ascii_lowercase()) {
        None => RelayTransport::Udp,
        Some(t) if t == "udp" => RelayTransport::Udp,
        Some(t) if t == "tcp" => RelayTransport::Tcp,
        Some(_) => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(TurnRelay { host, port, username, password, transport })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_defaults_to_3478() {
        assert_eq!(
            parse_host_port("stun.example.org"),
            Some(("stun.example.org".to_string(), 3478))
        );
        assert_eq!(
            parse_host_port("stun.example.org:19302"),
            Some(("stun.example.org".to_string(), 19302))
        );
        assert!(parse_host_port("").is_none());
        assert!(parse_host_port(":3478").is_none());
        assert!(parse_host_port("host:notaport").is_none());
    }

    #[test]
    fn turn_spec_parses_credentials_and_transport() {
        let relay = parse_turn_spec("relay.example.org:3479,alice,wonder").unwrap();
        assert_eq!(relay.host, "relay.example.org");
        assert_eq!(relay.port, 3479);
        assert_eq!(relay.username, "alice");
        assert_eq!(relay.password, "wonder");
        assert_eq!(relay.transport, RelayTransport::Udp);

        let relay = parse_turn_spec("relay.example.org,bob,builder,tcp").unwrap();
        assert_eq!(relay.port, 3478);
        assert_eq!(relay.transport, RelayTransport::Tcp);

        assert!(parse_turn_spec("relay.example.org").is_none());
        assert!(parse_turn_spec("relay.example.org,user").is_none());
        assert!(parse_turn_spec("relay.example.org,user,pass,carrier-pigeon").is_none());
    }

    #[test]
    fn args_accept_the_historic_flags() {
        let args = Args::try_parse_from([
            "rudt",
            "-vv",
            "send-file",
            "payload.bin",
            "--stun=stun.example.org",
            "--turn=relay.example.org,u,p",
            "--monitor",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::SendFile { file, stun, turn, monitor, peer } => {
                assert_eq!(file, PathBuf::from("payload.bin"));
                assert_eq!(stun.as_deref(), Some("stun.example.org"));
                assert!(turn.is_some());
                assert!(monitor);
                assert!(peer.is_none());
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
