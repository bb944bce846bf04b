//! Client subcommands: `request`, `publish`, `subscribe`, `service`.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use apix::proto::{Leader, Reply, Status};
use apix::{Client, Error};
use tracing::{debug, info, warn};

/// Where the bus listens.
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
pub struct Target {
    /// Connect over a Unix-domain socket.
    #[arg(long, value_name = "PATH")]
    unix: Option<PathBuf>,

    /// Connect over TCP.
    #[arg(long, value_name = "ADDR")]
    tcp: Option<String>,
}

impl Target {
    fn connect(&self) -> Result<Client> {
        match (&self.unix, &self.tcp) {
            (Some(path), _) => Client::connect_unix(path)
                .with_context(|| format!("connecting to {}", path.display())),
            (None, Some(addr)) => {
                Client::connect_tcp(addr.as_str()).with_context(|| format!("connecting to {addr}"))
            }
            (None, None) => anyhow::bail!("pass --unix or --tcp"),
        }
    }
}

/// Arguments for `apix request`.
#[derive(clap::Args)]
pub struct RequestArgs {
    #[command(flatten)]
    target: Target,

    /// Service header, e.g. `/hello/x`.
    header: String,

    /// JSON payload.
    #[arg(default_value = "{}")]
    data: String,

    /// Give up after this many milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

impl RequestArgs {
    pub fn run(self) -> Result<()> {
        let mut client = self.target.connect()?;
        client.set_read_timeout(Some(Duration::from_millis(self.timeout_ms)))?;
        let resp = client
            .request(&self.header, &self.data)
            .with_context(|| format!("calling {}", self.header))?;
        println!("{}", String::from_utf8_lossy(resp.data()));
        match Reply::parse(resp.data()).and_then(|r| r.status()) {
            Some(status) if status != Status::Ok => anyhow::bail!("{}: {status}", self.header),
            _ => Ok(()),
        }
    }
}

/// Arguments for `apix publish`.
#[derive(clap::Args)]
pub struct PublishArgs {
    #[command(flatten)]
    target: Target,

    /// Topic header.
    topic: String,

    /// JSON payload.
    data: String,
}

impl PublishArgs {
    pub fn run(self) -> Result<()> {
        let mut client = self.target.connect()?;
        client.publish(&self.topic, &self.data)?;
        Ok(())
    }
}

/// Arguments for `apix subscribe`.
#[derive(clap::Args)]
pub struct SubscribeArgs {
    #[command(flatten)]
    target: Target,

    /// Topic headers.
    #[arg(required = true, num_args = 1..)]
    topics: Vec<String>,
}

impl SubscribeArgs {
    pub fn run(self) -> Result<()> {
        let mut client = self.target.connect()?;
        for topic in &self.topics {
            let status = client.subscribe(topic)?;
            if status != Status::Ok {
                anyhow::bail!("subscribing to {topic}: {status}");
            }
            info!(topic = %topic, "subscribed");
        }

        let stop = crate::shutdown_flag()?;
        client.set_read_timeout(Some(Duration::from_millis(200)))?;
        while !stop.load(Ordering::Relaxed) {
            match client.recv() {
                Ok(p) if p.leader() == Leader::Publish => {
                    println!("{} {}", p.header(), String::from_utf8_lossy(p.data()));
                }
                Ok(p) => debug!(?p, "ignored"),
                Err(e) if timed_out(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Arguments for `apix service`.
#[derive(clap::Args)]
pub struct ServiceArgs {
    #[command(flatten)]
    target: Target,

    /// Service header to register.
    header: String,

    /// Fixed JSON reply; requests are echoed back when omitted.
    #[arg(long)]
    reply: Option<String>,

    /// Seconds between liveness refreshes.
    #[arg(long, default_value_t = 20)]
    alive_secs: u64,
}

impl ServiceArgs {
    pub fn run(self) -> Result<()> {
        let mut client = self.target.connect()?;
        let status = client.add_service(&self.header)?;
        if status != Status::Ok {
            anyhow::bail!("registering {}: {status}", self.header);
        }
        info!(header = %self.header, "service registered");

        let stop = crate::shutdown_flag()?;
        let beat = Duration::from_secs(self.alive_secs.max(1));
        let mut last_beat = Instant::now();
        client.set_read_timeout(Some(Duration::from_millis(200)))?;

        while !stop.load(Ordering::Relaxed) {
            if last_beat.elapsed() >= beat {
                let status = client.alive(&self.header)?;
                if status != Status::Ok {
                    anyhow::bail!("{} lost its registration: {status}", self.header);
                }
                last_beat = Instant::now();
            }
            match client.recv() {
                Ok(req) if req.leader() == Leader::Request && req.header() == self.header => {
                    let body = match &self.reply {
                        Some(fixed) => fixed.clone(),
                        None => String::from_utf8_lossy(req.data()).into_owned(),
                    };
                    client.respond(&req, &body)?;
                    debug!(reqid = req.reqid(), "answered");
                }
                Ok(p) if p.leader() == Leader::Response => {
                    let status = Reply::parse(p.data()).and_then(|r| r.status());
                    if status == Some(Status::ServiceExpired) {
                        anyhow::bail!("{} expired", p.header());
                    }
                }
                Ok(p) => warn!(?p, "unexpected frame"),
                Err(e) if timed_out(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = client.del_service(&self.header) {
            warn!(error = %e, "deregistration failed");
        }
        Ok(())
    }
}

fn timed_out(e: &Error) -> bool {
    matches!(e, Error::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
}
