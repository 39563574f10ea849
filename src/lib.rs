pub mod capture;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capture::{LoopOptions, PixelFormat};
use output::SinkKind;
use pipeline::Backpressure;
use serde::{Deserialize, Serialize};

pub use error::{CaptureError, ConvertError, SinkError};

/// Shared cooperative stop flag. Raised once, observed by every role.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub run: RunConfig,
    pub output: OutputConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node, or `mock` for the simulated camera
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// `None` for an unbounded channel
    pub channel_capacity: Option<usize>,
    pub backpressure: Backpressure,
    pub consumers: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_frames: Option<u64>,
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub sinks: Vec<SinkKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub sample_window: u32,
    pub summarize_first_frame: bool,
    /// Analyze sink summarizes every Nth frame
    pub analyze_every: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: Some(8),
            backpressure: Backpressure::Block,
            consumers: 1,
            poll_interval_ms: 100,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_frames: Some(5),
            max_duration_secs: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("frames"),
            sinks: vec![SinkKind::Raw, SinkKind::Ppm],
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            sample_window: convert::DEFAULT_SAMPLE_WINDOW,
            summarize_first_frame: true,
            analyze_every: 30,
        }
    }
}

impl Config {
    /// Defaults, then `path` (TOML) if given, then `RINGCAP__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("RINGCAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.poll_interval_ms.max(1))
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            max_frames: self.run.max_frames,
            max_duration: self.run.max_duration_secs.map(Duration::from_secs),
            poll_interval: self.poll_interval(),
            summarize_first_frame: self.diagnostics.summarize_first_frame,
            sample_window: self.diagnostics.sample_window,
        }
    }

    /// True when the device path selects the simulated camera.
    pub fn uses_mock(&self) -> bool {
        self.capture.device.as_os_str() == "mock"
    }
}
