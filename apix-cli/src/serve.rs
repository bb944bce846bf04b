//! `apix serve`: run a bus until interrupted.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use apix::{
    Baud, Bus, BusConfig, DataBits, Ioctl, Parity, SerialParams, SerialSink, StopBits, TcpSink,
    UnixSink,
};
use tracing::{info, warn};

/// Arguments for `apix serve`.
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Listen on a Unix-domain socket (repeatable).
    #[arg(long, value_name = "PATH")]
    pub unix: Vec<PathBuf>,

    /// Listen on a TCP address (repeatable).
    #[arg(long, value_name = "ADDR")]
    pub tcp: Vec<String>,

    /// Attach a serial device (repeatable).
    #[arg(long, value_name = "DEV")]
    pub serial: Vec<String>,

    /// Serial line speed.
    #[arg(long, default_value = "115200")]
    baud: BaudArg,

    /// Serial data bits.
    #[arg(long, default_value = "8")]
    bits: BitsArg,

    /// Serial parity.
    #[arg(long, default_value = "none")]
    parity: ParityArg,

    /// Serial stop bits.
    #[arg(long, default_value = "1")]
    stop: StopArg,

    /// Bus settings as JSON.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Longest wait per poll cycle, in milliseconds.
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum BaudArg {
    #[value(name = "9600")]
    B9600,
    #[value(name = "115200")]
    B115200,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum BitsArg {
    #[value(name = "7")]
    Seven,
    #[value(name = "8")]
    Eight,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ParityArg {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StopArg {
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
}

impl ServeArgs {
    fn serial_params(&self) -> SerialParams {
        SerialParams::new(
            match self.baud {
                BaudArg::B9600 => Baud::B9600,
                BaudArg::B115200 => Baud::B115200,
            },
            match self.bits {
                BitsArg::Seven => DataBits::Seven,
                BitsArg::Eight => DataBits::Eight,
            },
            match self.parity {
                ParityArg::None => Parity::None,
                ParityArg::Odd => Parity::Odd,
                ParityArg::Even => Parity::Even,
            },
            match self.stop {
                StopArg::One => StopBits::One,
                StopArg::Two => StopBits::Two,
            },
        )
    }

    pub fn run(self) -> Result<()> {
        if self.unix.is_empty() && self.tcp.is_empty() && self.serial.is_empty() {
            anyhow::bail!("nothing to serve: pass --unix, --tcp or --serial");
        }
        let config = match &self.config {
            Some(path) => BusConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BusConfig::default(),
        };

        let mut bus = Bus::new(config);
        bus.add_sink(UnixSink::new())?;
        bus.add_sink(TcpSink::new())?;
        bus.add_sink(SerialSink::new())?;

        for path in &self.unix {
            let addr = path
                .to_str()
                .with_context(|| format!("non UTF-8 socket path {}", path.display()))?;
            bus.open("unix", addr)
                .with_context(|| format!("listening on {addr}"))?;
            info!(addr, "unix listener ready");
        }
        for addr in &self.tcp {
            bus.open("tcp", addr)
                .with_context(|| format!("listening on {addr}"))?;
            info!(addr = %addr, "tcp listener ready");
        }
        let params = self.serial_params();
        for dev in &self.serial {
            let handle = bus
                .open("serial", dev)
                .with_context(|| format!("opening {dev}"))?;
            bus.ioctl(handle, &Ioctl::Serial(params))
                .with_context(|| format!("configuring {dev}"))?;
            info!(dev = %dev, "serial line ready");
        }

        let stop = crate::shutdown_flag()?;
        let interval = Duration::from_millis(self.interval_ms);
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = bus.poll(interval) {
                warn!(error = %e, "poll cycle reported an error");
            }
        }
        info!("shutting down");
        Ok(())
    }
}
