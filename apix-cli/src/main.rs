//! CLI for the apix message bus.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod call;
mod serve;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "apix", version, about = "Message bus for sockets and serial lines")]
struct Cli {
    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a bus on the given transports.
    Serve(Box<serve::ServeArgs>),

    /// Call a service and print its response.
    Request(call::RequestArgs),

    /// Publish one message to a topic.
    #[command(visible_alias = "pub")]
    Publish(call::PublishArgs),

    /// Print messages published on one or more topics.
    #[command(visible_alias = "sub")]
    Subscribe(call::SubscribeArgs),

    /// Register a service and answer its requests.
    Service(call::ServiceArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    if let Err(e) = cli.dispatch() {
        eprintln!("apix: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Serve(args) => args.run(),
            Command::Request(args) => args.run(),
            Command::Publish(args) => args.run(),
            Command::Subscribe(args) => args.run(),
            Command::Service(args) => args.run(),
            Command::Completion { shell } => {
                let mut cmd = Self::command();
                clap_complete::generate(shell, &mut cmd, "apix", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// A flag raised by SIGINT or SIGTERM.
fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&stop))
            .with_context(|| format!("registering handler for signal {sig}"))?;
    }
    Ok(stop)
}
