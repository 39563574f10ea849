//! Device session: the open handle plus the negotiated format.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::driver::Driver;
use super::frame::{AcceptedFormat, PixelFormat};
use super::v4l2::V4l2Driver;
use crate::error::{CaptureError, Result};

/// Outcome of a format request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Exact(AcceptedFormat),
    /// The driver picked different values; downstream sizing must use `accepted`.
    Adjusted {
        requested: (u32, u32, PixelFormat),
        accepted: AcceptedFormat,
    },
}

impl Negotiation {
    pub fn accepted(&self) -> AcceptedFormat {
        match *self {
            Self::Exact(accepted) | Self::Adjusted { accepted, .. } => accepted,
        }
    }

    pub fn was_adjusted(&self) -> bool {
        matches!(self, Self::Adjusted { .. })
    }
}

/// Owns one open capture device.
pub struct DeviceSession<D: Driver> {
    path: PathBuf,
    driver: D,
    format: Option<AcceptedFormat>,
    closed: bool,
}

impl DeviceSession<V4l2Driver> {
    /// Open a V4L2 node such as `/dev/video0`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let driver = V4l2Driver::open(path).map_err(|source| CaptureError::DeviceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::with_driver(path, driver))
    }
}

impl<D: Driver> DeviceSession<D> {
    /// Wrap an already opened driver.
    pub fn with_driver(path: impl Into<PathBuf>, driver: D) -> Self {
        let path = path.into();
        info!("Opened capture device {} - {}", path.display(), driver.describe());
        Self {
            path,
            driver,
            format: None,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format accepted by the last successful negotiation.
    pub fn format(&self) -> Option<AcceptedFormat> {
        self.format
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub(crate) fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Request a format. A driver that picks other values is not an error;
    /// the accepted values are stored and returned.
    pub fn negotiate(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Negotiation> {
        if self.closed {
            return Err(CaptureError::InvalidState("session is closed"));
        }
        let accepted = self
            .driver
            .set_format(width, height, format)
            .map_err(CaptureError::FormatRejected)?;
        self.format = Some(accepted);

        if accepted.matches(width, height, format) {
            info!(
                "Format: {}x{} {}",
                accepted.width, accepted.height, accepted.format
            );
            return Ok(Negotiation::Exact(accepted));
        }

        warn!(
            "Driver adjusted format: requested {}x{} {}, using {}x{} {}",
            width, height, format, accepted.width, accepted.height, accepted.format
        );
        metrics::counter!("format_adjusted").increment(1);
        Ok(Negotiation::Adjusted {
            requested: (width, height, format),
            accepted,
        })
    }

    /// Release the handle. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing {}", self.path.display());
        self.driver.close().map_err(CaptureError::DriverFault)
    }
}

impl<D: Driver> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockDriver;

    #[test]
    fn exact_negotiation() {
        let mut session = DeviceSession::with_driver("mock", MockDriver::new());
        let outcome = session.negotiate(640, 480, PixelFormat::Yuyv).unwrap();
        assert!(!outcome.was_adjusted());
        assert_eq!(outcome.accepted().expected_frame_size(), 614_400);
        assert_eq!(session.format(), Some(outcome.accepted()));
    }

    #[test]
    fn adjusted_format_is_reported_not_failed() {
        let driver = MockDriver::new().with_adjusted_format(320, 240, PixelFormat::Yuyv);
        let mut session = DeviceSession::with_driver("mock", driver);
        let outcome = session.negotiate(640, 480, PixelFormat::Yuyv).unwrap();

        match outcome {
            Negotiation::Adjusted {
                requested,
                accepted,
            } => {
                assert_eq!(requested, (640, 480, PixelFormat::Yuyv));
                assert_eq!((accepted.width, accepted.height), (320, 240));
            }
            Negotiation::Exact(_) => panic!("expected an adjusted format"),
        }
        assert_eq!(session.format().unwrap().width, 320);
    }

    #[test]
    fn rejected_format_is_fatal() {
        let driver = MockDriver::new().with_rejected_format();
        let mut session = DeviceSession::with_driver("mock", driver);
        let err = session.negotiate(640, 480, PixelFormat::Yuyv).unwrap_err();
        assert!(matches!(err, CaptureError::FormatRejected(_)));
    }

    #[test]
    fn close_is_idempotent() {
        let mut session = DeviceSession::with_driver("mock", MockDriver::new());
        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
        assert!(session.driver().is_closed());
        assert!(session.negotiate(640, 480, PixelFormat::Yuyv).is_err());
    }

    #[test]
    fn missing_device_is_unavailable() {
        let err = DeviceSession::open("/dev/this-video-node-does-not-exist").err().unwrap();
        assert!(matches!(err, CaptureError::DeviceUnavailable { .. }));
    }
}
