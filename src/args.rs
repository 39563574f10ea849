use clap::Parser;
use ringcap::capture::PixelFormat;
use ringcap::Config;
use std::path::PathBuf;

/// Pixel formats selectable on the command line.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum FormatArg {
    /// Packed 4:2:2 YUV
    Yuyv,
    /// Motion JPEG, stored as-is
    Mjpeg,
    /// Packed 24-bit RGB
    Rgb24,
}

impl From<FormatArg> for PixelFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Yuyv => Self::Yuyv,
            FormatArg::Mjpeg => Self::Mjpeg,
            FormatArg::Rgb24 => Self::Rgb24,
        }
    }
}

/// Command-line arguments for ringcap.
///
/// Every option overrides the matching configuration key. Configuration is
/// read from defaults, then the `--config` file, then `RINGCAP__SECTION__KEY`
/// environment variables, then these flags.
///
/// # Example
///
/// ```bash
/// ringcap --device /dev/video0 --width 1280 --height 720 --frames 10
///
/// # Without hardware
/// ringcap --device mock --output /tmp/frames
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "RINGCAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Capture device path (e.g., /dev/video0), or `mock`
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Requested frame width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Requested frame height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// Requested pixel format
    #[arg(short, long, value_enum)]
    pub format: Option<FormatArg>,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    pub frames: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration: Option<u64>,

    /// Directory for saved frames
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Args {
    /// Apply command-line overrides on top of loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(format) = self.format {
            config.capture.format = format.into();
        }
        if let Some(frames) = self.frames {
            config.run.max_frames = Some(frames);
        }
        if let Some(duration) = self.duration {
            config.run.max_duration_secs = Some(duration);
        }
        if let Some(output) = &self.output {
            config.output.dir = output.clone();
        }
    }
}
