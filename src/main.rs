use anyhow::{anyhow, Context, Result};
use clap::Parser;
use confique::Config;
use log::{info, warn, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use std::{fs::File, path::PathBuf, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use wavedaq::{Conf, Digitizer, GroupConfig, SimDigitizer};

/// Runs one acquisition session against a simulated digitizer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Debug level logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the number of software triggers
    #[arg(short, long)]
    triggers: Option<u32>,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));
    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(
            LevelFilter::Debug,
            simplelog::Config::default(),
            file,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let started = OffsetDateTime::now_utc();
    info!("Session started at {}", started.format(&Rfc3339)?);

    let config = Conf::builder()
        .env()
        .file(&args.config)
        .load()
        .with_context(|| format!("cannot load {}", args.config.display()))?;

    let device = &config.device;
    let mut dig = Digitizer::<SimDigitizer>::open(device.connection, device.model, device.link())?;
    dig.connection_mut()
        .device_mut()
        .reseed(config.run.seed)
        .map_err(|code| anyhow!("cannot seed simulator: {code}"))?;

    let model = device.model.constants();
    let groups = if config.acquisition.groups.is_empty() {
        vec![GroupConfig::enabled(model.channels_per_group); model.num_groups]
    } else {
        config.acquisition.groups.clone()
    };
    dig.apply(&config.acquisition.global, &groups)?;
    info!(
        "Device buffer holds {} events, link moves {} S/s",
        dig.max_possible_buffer_depth(),
        device.connection.transfer_rate()
    );

    dig.arm()?;
    if let Some(period) = config.run.test_pulse_period_ms {
        dig.connection_mut()
            .device_mut()
            .start_pulser(Duration::from_millis(period))
            .map_err(|code| anyhow!("cannot start test pulser: {code}"))?;
    }

    let triggers = args.triggers.unwrap_or(config.run.software_triggers);
    let interval = Duration::from_micros(config.run.trigger_interval_us);
    for _ in 0..triggers {
        dig.software_trigger()?;
        thread::sleep(interval);
        if dig.drain_if_available(config.run.drain_batch)? {
            dig.decode()?;
        }
    }

    dig.connection_mut().device_mut().stop_pulser();
    dig.disarm()?;
    dig.drain_all()?;
    dig.decode()?;

    let counter = dig.drain_engine().counter();
    info!(
        "Read {} events ({} bytes), average readout rate {:.3} MiB/s",
        counter.n_events,
        counter.total_size,
        counter.average_rate()
    );
    match dig.lost_triggers()? {
        Some(0) | None => (),
        Some(n) => warn!("{n} triggers were lost, drain more often"),
    }

    if let Ok(first) = dig.event(0) {
        let tag_period = model.time_tag_period_ns;
        info!(
            "First event: counter {}, {} channels x {} samples, trigger at {:.0} ns",
            first.info.event_counter,
            first.num_channels(),
            first.record_length(),
            first.info.trigger_time_ns(tag_period)
        );
    }
    if let Some(all) = dig.events().to_array() {
        info!("Waveform array shape {:?}", all.dim());
    }

    dig.close()?;
    let elapsed = OffsetDateTime::now_utc() - started;
    info!(
        "Session finished after {:.3} s",
        elapsed.as_seconds_f64()
    );
    Ok(())
}
