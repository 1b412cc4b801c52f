//! tapmesh — peer-to-peer layer-2 VPN client.

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::Directive;

use tapmesh::config::{Args, Config};
use tapmesh::io;
use tapmesh::node::{Ev, Node};
use tapmesh::reactor::Reactor;
use tapmesh::transport::TransportMode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging(directive: Directive) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();
}

fn main() {
    let args = Args::parse();

    // The --log directive is validated with the rest of the configuration;
    // reporting a bad one uses the default filter.
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            init_logging(Config::default_log_directive());
            error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(config.log.clone());

    match run(config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("failed to start: {:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_config: Config) -> anyhow::Result<i32> {
    anyhow::bail!("no tap device support on this platform");
}

#[cfg(target_os = "linux")]
fn run(config: Config) -> anyhow::Result<i32> {
    info!("════════════════════════════════════════════════════════════");
    info!("  tapmesh v{}", VERSION);
    info!("════════════════════════════════════════════════════════════");
    info!(
        "server: {} | transport: {} | peers via {} bind address(es)",
        config.server_addr,
        match config.transport {
            TransportMode::Udp => "udp",
            TransportMode::Tcp => "tcp",
        },
        config.bind_addrs.len(),
    );

    // All socket and device pumps run on the tokio runtime; the node itself
    // runs on the reactor thread and hears about completions through the
    // inbox.
    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    let handle = runtime.handle().clone();

    let mut reactor: Reactor<Ev> = Reactor::new();
    let server_source = reactor.source_register();
    let device_source = reactor.source_register();
    let signal_source = reactor.source_register();

    let server_link = io::connect_server(&handle, &config, reactor.inbox(), server_source)
        .context("server connection")?;

    let device =
        io::open_tap(&config.tap, 1500, reactor.inbox(), device_source).context("tap device")?;

    let acceptors = io::PasswordAcceptors::default();
    if config.transport == TransportMode::Tcp {
        for bind in &config.bind_addrs {
            acceptors
                .start_listener(&handle, bind.addr)
                .with_context(|| format!("listener on {}", bind.addr))?;
        }
    }
    let factory = Box::new(io::NetFactory::new(handle.clone(), acceptors));

    // Ctrl-C turns into a clean shutdown event.
    let signal_inbox = reactor.inbox();
    handle.spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_inbox.send(signal_source, Ev::Terminate);
    });

    let mut node = Node::new(
        config,
        &mut reactor,
        Box::new(server_link),
        server_source,
        Box::new(device),
        device_source,
        factory,
    );
    node.start();
    Ok(reactor.run(&mut node))
}
