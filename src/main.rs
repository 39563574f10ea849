//! ringcap: stream frames from a V4L2 device through a memory-mapped ring

mod args;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ringcap::capture::{
    BufferRing, CaptureLoop, CaptureReport, DeviceSession, Driver, MockDriver, PixelFormat,
};
use ringcap::output::{build_sinks, Consumer, ConsumerReport};
use ringcap::pipeline::{FrameChannel, FrameReceiver, FrameSender};
use ringcap::{Config, StopSignal};

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ringcap=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    args.apply(&mut config);

    info!(
        "ringcap launching: {} {}x{} {}",
        config.capture.device.display(),
        config.capture.width,
        config.capture.height,
        config.capture.format
    );

    tokio::fs::create_dir_all(&config.output.dir)
        .await
        .wrap_err_with(|| format!("creating {}", config.output.dir.display()))?;

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping capture");
                stop.raise();
            }
        });
    }

    let (tx, rx) = FrameChannel::new(
        config.pipeline.channel_capacity,
        config.pipeline.backpressure,
    );
    let tx = tx.with_poll_interval(config.poll_interval());

    // Capture runs on the blocking pool; it reports the accepted format
    // once negotiated so consumers can pick their sinks
    let (format_tx, format_rx) = oneshot::channel();
    let capture = {
        let config = config.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || run_capture(&config, tx, format_tx, &stop))
    };

    let consumers = match format_rx.await {
        Ok(format) => spawn_consumers(&config, format, &rx),
        Err(_) => Vec::new(),
    };
    drop(rx);

    let captured = capture.await.wrap_err("capture task panicked")?;

    let mut consumer_errors = 0;
    for handle in consumers {
        let report = handle.await.wrap_err("consumer task panicked")?;
        consumer_errors += report.errors;
    }
    if consumer_errors > 0 {
        warn!("{} frames could not be processed by consumers", consumer_errors);
    }

    match captured {
        Ok(report) => {
            info!(
                "{} incomplete, {} dropped, {} empty polls",
                report.incomplete, report.dropped, report.would_block
            );
            info!("ringcap shutting down");
            Ok(())
        }
        Err(e) => {
            error!("Capture failed: {}", e);
            Err(e).wrap_err_with(|| format!("capturing from {}", config.capture.device.display()))
        }
    }
}

fn spawn_consumers(
    config: &Config,
    format: PixelFormat,
    rx: &FrameReceiver,
) -> Vec<JoinHandle<ConsumerReport>> {
    (0..config.pipeline.consumers.max(1))
        .map(|id| {
            let sinks = build_sinks(
                &config.output.sinks,
                format,
                &config.output.dir,
                config.diagnostics.sample_window,
                config.diagnostics.analyze_every,
            );
            let consumer = Consumer::new(id, rx.clone(), sinks);
            tokio::task::spawn_blocking(move || consumer.run())
        })
        .collect()
}

fn run_capture(
    config: &Config,
    tx: FrameSender,
    format_tx: oneshot::Sender<PixelFormat>,
    stop: &StopSignal,
) -> ringcap::error::Result<CaptureReport> {
    if config.uses_mock() {
        let session = DeviceSession::with_driver("mock", MockDriver::new());
        capture_with(session, config, tx, format_tx, stop)
    } else {
        let session = DeviceSession::open(&config.capture.device)?;
        capture_with(session, config, tx, format_tx, stop)
    }
}

fn capture_with<D: Driver>(
    mut session: DeviceSession<D>,
    config: &Config,
    tx: FrameSender,
    format_tx: oneshot::Sender<PixelFormat>,
    stop: &StopSignal,
) -> ringcap::error::Result<CaptureReport> {
    let requested = &config.capture;
    let accepted = session
        .negotiate(requested.width, requested.height, requested.format)?
        .accepted();
    // The receiver is gone only if main is already unwinding
    let _ = format_tx.send(accepted.format);

    let ring = BufferRing::prepare(&mut session, requested.buffer_count)?;
    let mut capture = CaptureLoop::new(ring, config.loop_options())?;
    let report = capture.run(tx, stop)?;
    drop(capture);

    session.close()?;
    Ok(report)
}
