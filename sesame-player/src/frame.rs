use std::fmt::{self, Debug};

/// An opaque decoded frame. The core never looks at pixels; it only moves
/// the handle between decoder, scheduler and renderer. The release action
/// runs exactly once, either through [`Self::close`] or on drop.
pub struct DecodedFrame {
    timestamp_us: i64,
    width: u32,
    height: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DecodedFrame {
    pub fn new(timestamp_us: i64, width: u32, height: u32) -> Self {
        Self {
            timestamp_us,
            width,
            height,
            release: None,
        }
    }

    pub fn with_release(
        timestamp_us: i64,
        width: u32,
        height: u32,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            timestamp_us,
            width,
            height,
            release: Some(Box::new(release)),
        }
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Releases the underlying frame resources.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for DecodedFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("timestamp_us", &self.timestamp_us)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn counting_frame(counter: &Arc<AtomicUsize>) -> DecodedFrame {
        let counter = counter.clone();
        DecodedFrame::with_release(0, 640, 360, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_release_on_close() {
        let released = Arc::new(AtomicUsize::new(0));

        counting_frame(&released).close();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));

        drop(counting_frame(&released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));

        let frame = counting_frame(&released);
        let moved = frame;
        moved.close();

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
