//! Fixture firmware entry point.
//!
//! Opens the host and motion-controller serial links, runs the startup
//! calibration and homing pass, then services host motion messages until
//! killed.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serialport::SerialPort;
use tracing::{info, warn, Level};

use firmware::config::{FixtureConfig, Profile};
use firmware::fixture::Fixture;
use firmware::protocol::MessageFramer;
use firmware::startup::{Sequencer, SequencerStatus};
use hardware::odrive::{MotionController, OdriveLink};
use hardware::quadrature::{
    Ls7366r, PositionSensor, RegisterBus, SensorError, SensorResult, SignMode,
};

/// Interval between host link statistics reports.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(about = "Pan/tilt stage-light motion firmware")]
struct Args {
    /// Serial port carrying host motion messages.
    #[arg(long, default_value = "/dev/ttyAMA0")]
    host_port: String,

    /// Serial port to the motion controller.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    controller_port: String,

    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Axis complement this build drives.
    #[arg(long, value_enum, default_value_t = Profile::Body)]
    profile: Profile,

    /// Fixture config JSON overriding the profile defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// SPI device node for the quadrature counter. Without it homing
    /// falls back to the search timeout.
    #[arg(long)]
    encoder_spi: Option<PathBuf>,

    /// Counter boards that report magnitude plus a status sign flag
    /// instead of a two's-complement count.
    #[arg(long)]
    encoder_sign_flag: bool,

    /// Startup sequencer tick period in milliseconds.
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,

    #[arg(long, short)]
    verbose: bool,
}

/// Register access to the counter chip through a spidev node. The chip
/// latches the opcode from the write and clocks the register contents out
/// on the following read.
struct SpidevBus {
    dev: std::fs::File,
}

impl RegisterBus for SpidevBus {
    fn read_register(&mut self, opcode: u8, out: &mut [u8]) -> SensorResult<()> {
        self.dev
            .write_all(&[opcode])
            .map_err(|e| SensorError::Bus(e.to_string()))?;
        self.dev
            .read_exact(out)
            .map_err(|e| SensorError::Bus(e.to_string()))?;
        Ok(())
    }
}

/// Position sensor as configured on the command line: a real counter, or
/// nothing. A missing sensor reads a constant zero, which never crosses
/// sign, so the homing search runs to its timeout and fails open.
enum Sensor {
    Counter(Ls7366r<SpidevBus>),
    None,
}

impl PositionSensor for Sensor {
    fn signed_count(&mut self) -> SensorResult<i32> {
        match self {
            Sensor::Counter(counter) => counter.signed_count(),
            Sensor::None => Ok(0),
        }
    }
}

fn open_sensor(args: &Args) -> Result<Sensor> {
    let Some(path) = &args.encoder_spi else {
        warn!("no quadrature device configured; homing will rely on its timeout");
        return Ok(Sensor::None);
    };
    let dev = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening quadrature device {}", path.display()))?;
    let sign_mode = if args.encoder_sign_flag {
        SignMode::StatusFlag
    } else {
        SignMode::TwosComplement
    };
    info!(device = %path.display(), ?sign_mode, "quadrature counter attached");
    Ok(Sensor::Counter(Ls7366r::new(SpidevBus { dev }, sign_mode)))
}

#[derive(Debug)]
struct LinkStats {
    messages: u64,
    framing_faults: u64,
    dispatch_faults: u64,
    last_report: Instant,
}

impl LinkStats {
    fn new(now: Instant) -> Self {
        Self {
            messages: 0,
            framing_faults: 0,
            dispatch_faults: 0,
            last_report: now,
        }
    }

    fn maybe_report(&mut self, now: Instant) {
        if now.duration_since(self.last_report) < STATS_INTERVAL {
            return;
        }
        info!(
            messages = self.messages,
            framing_faults = self.framing_faults,
            dispatch_faults = self.dispatch_faults,
            "host link stats"
        );
        self.last_report = now;
    }
}

fn serve<M: MotionController>(
    fixture: &mut Fixture,
    link: &mut M,
    mut host: Box<dyn SerialPort>,
) -> Result<()> {
    let mut framer = MessageFramer::new();
    let mut scratch = [0u8; 256];
    let mut stats = LinkStats::new(Instant::now());
    info!("serving host link");

    loop {
        match host.read(&mut scratch) {
            Ok(0) => {}
            Ok(n) => framer.push(&scratch[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e).context("host port read"),
        }

        let now = Instant::now();
        while let Some(result) = framer.next_message(now) {
            match result {
                Ok(message) => {
                    stats.messages += 1;
                    if let Err(e) = fixture.handle(link, &mut host, message) {
                        warn!(error = %e, "message dispatch failed");
                        stats.dispatch_faults += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "host framing fault");
                    stats.framing_faults += 1;
                }
            }
        }

        stats.maybe_report(now);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .init();

    let config = match &args.config {
        Some(path) => {
            FixtureConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => FixtureConfig::for_profile(args.profile),
    };
    info!(
        identifier = format_args!("{:#04x}", config.identifier),
        axes = config.axes.len(),
        "fixture configured"
    );

    let controller = serialport::new(&args.controller_port, args.baud)
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("opening controller port {}", args.controller_port))?;
    let mut link = OdriveLink::new(controller);

    let host = serialport::new(&args.host_port, args.baud)
        .timeout(Duration::from_millis(5))
        .open()
        .with_context(|| format!("opening host port {}", args.host_port))?;

    let mut sensor = open_sensor(&args)?;

    info!("starting calibration and homing pass");
    let tick = Duration::from_millis(args.tick_ms);
    let mut sequencer = Sequencer::new(&config, Instant::now());
    while sequencer.tick(&mut link, &mut sensor, Instant::now()) == SequencerStatus::InProgress {
        std::thread::sleep(tick);
    }
    for report in sequencer.reports() {
        info!(
            motor = report.motor,
            plan = ?report.plan,
            index_found = report.index_found,
            start_index = report.start_index,
            "axis startup complete"
        );
    }

    let mut fixture = Fixture::new(&config, &sequencer.reports());
    serve(&mut fixture, &mut link, host)
}
