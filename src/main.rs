use std::process::ExitCode;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use receptor::{
    ConfigError, ControlConfig, ListenerConfig, Node, NodeConfig, PeerConfig, ServiceConfig,
    TransportKind,
};

/// Option groups take `key=value` tokens, e.g. `--tcp-listener port=0 cost=2`.
/// A flag may repeat; each occurrence is one group. The group fields hold
/// every occurrence flattened, so they are read back per occurrence through
/// [`OptionGroups`].
#[derive(Parser, Debug)]
#[allow(dead_code)]
#[command(name = "receptor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identity: id=<node-id>
    #[arg(long, required = true, num_args = 1.., value_name = "OPTION")]
    node: Vec<String>,

    /// TCP listener: port=<u16> [cost=<n>] [nodecost=<json>] [bindaddr=<ip>]
    #[arg(long = "tcp-listener", num_args = 1.., value_name = "OPTION")]
    tcp_listener: Vec<String>,

    /// WebSocket listener, same options as --tcp-listener
    #[arg(long = "ws-listener", num_args = 1.., value_name = "OPTION")]
    ws_listener: Vec<String>,

    /// UDP listener, same options as --tcp-listener
    #[arg(long = "udp-listener", num_args = 1.., value_name = "OPTION")]
    udp_listener: Vec<String>,

    /// Outbound peer: address=<host:port> [kind=tcp|udp|ws] [cost=<n>] [redial=<bool>]
    #[arg(long, num_args = 1.., value_name = "OPTION")]
    peer: Vec<String>,

    /// Local service: name=<name> [sink=log|echo|discard] [tag:<k>=<v> ...]
    #[arg(long, num_args = 1.., value_name = "OPTION")]
    service: Vec<String>,

    /// Control endpoint: [port=<u16>] [filename=<path>]
    #[arg(long = "control-service", num_args = 1.., value_name = "OPTION")]
    control_service: Vec<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Repeated option groups, one `Vec` per flag occurrence.
struct OptionGroups {
    tcp_listener: Vec<Vec<String>>,
    ws_listener: Vec<Vec<String>>,
    udp_listener: Vec<Vec<String>>,
    peer: Vec<Vec<String>>,
    service: Vec<Vec<String>>,
    control_service: Vec<Vec<String>>,
}

impl OptionGroups {
    fn from_matches(matches: &ArgMatches) -> Self {
        let groups = |id: &str| -> Vec<Vec<String>> {
            matches
                .get_occurrences::<String>(id)
                .map(|occurrences| {
                    occurrences
                        .map(|tokens| tokens.cloned().collect::<Vec<_>>())
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            tcp_listener: groups("tcp_listener"),
            ws_listener: groups("ws_listener"),
            udp_listener: groups("udp_listener"),
            peer: groups("peer"),
            service: groups("service"),
            control_service: groups("control_service"),
        }
    }
}

fn build_config(args: &Args, groups: &OptionGroups) -> Result<NodeConfig, ConfigError> {
    let mut config = NodeConfig::parse_node(&args.node)?;
    let listener_groups = [
        (TransportKind::Tcp, &groups.tcp_listener),
        (TransportKind::Ws, &groups.ws_listener),
        (TransportKind::Udp, &groups.udp_listener),
    ];
    for (kind, occurrences) in listener_groups {
        for tokens in occurrences {
            config.listeners.push(ListenerConfig::parse(kind, tokens)?);
        }
    }
    for tokens in &groups.peer {
        config.peers.push(PeerConfig::parse(tokens)?);
    }
    for tokens in &groups.service {
        config.services.push(ServiceConfig::parse(tokens)?);
    }
    for tokens in &groups.control_service {
        config.control.push(ControlConfig::parse(tokens)?);
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Args::command().get_matches();
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };
    let groups = OptionGroups::from_matches(&matches);
    init_logging(&args.log_level);

    // Configuration errors go to stdout as a single line.
    let config = match build_config(&args, &groups) {
        Ok(config) => config,
        Err(e) => {
            println!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            println!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    shutdown_signal().await;
    info!("Received shutdown signal, exiting gracefully");
    node.shutdown().await;
    ExitCode::SUCCESS
}
