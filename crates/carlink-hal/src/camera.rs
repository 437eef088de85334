//! Generic `Camera` trait for the image-capture device.

use carlink_types::{LinkError, SensorFrame};

/// A camera or image-capture device.
///
/// Implementations return one compressed image per call.  Capture may block
/// for roughly one exposure; callers on an async runtime should run it on a
/// blocking-friendly thread when that matters.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"front"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Capture`] if the frame cannot be captured
    /// (e.g. the device is disconnected or the buffer is unavailable).
    fn capture(&mut self) -> Result<SensorFrame, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyCamera {
        calls: u32,
    }

    impl Camera for FlakyCamera {
        fn id(&self) -> &str {
            "flaky"
        }

        fn capture(&mut self) -> Result<SensorFrame, LinkError> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(LinkError::Capture {
                    component: self.id().to_string(),
                    details: "buffer unavailable".to_string(),
                });
            }
            Ok(SensorFrame::new(vec![0xFF, 0xD8, 0xFF, 0xD9]))
        }
    }

    #[test]
    fn capture_errors_name_the_component() {
        let mut cam = FlakyCamera { calls: 0 };
        assert_eq!(cam.capture().unwrap().len(), 4);
        match cam.capture() {
            Err(LinkError::Capture { component, .. }) => assert_eq!(component, "flaky"),
            other => panic!("expected capture error, got {other:?}"),
        }
    }
}
