//! Datapath accelerator hooks around a plugin invocation.

use tracing::{debug, warn};

/// An optional datapath component started before a command runs and
/// stopped after it finishes.
pub trait Accelerator {
    fn name(&self) -> &str;

    fn start(&mut self) -> anyhow::Result<()>;

    fn stop(&mut self);
}

/// The shipped accelerator: no datapath offload.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccelerator;

impl Accelerator for NoopAccelerator {
    fn name(&self) -> &str {
        "noop"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        debug!("No accelerator to start");
        Ok(())
    }

    fn stop(&mut self) {
        debug!("No accelerator to stop");
    }
}

/// Calls [`Accelerator::stop`] when dropped.
pub struct AcceleratorGuard<A: Accelerator> {
    inner: A,
}

impl<A: Accelerator> AcceleratorGuard<A> {
    /// Starts `accel`; a start failure is logged and the guard still stops it.
    pub fn start(mut accel: A) -> Self {
        if let Err(e) = accel.start() {
            warn!(accelerator = accel.name(), error = %e, "Accelerator failed to start");
        }
        Self { inner: accel }
    }
}

impl<A: Accelerator> Drop for AcceleratorGuard<A> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recording(Rc<RefCell<Vec<&'static str>>>);

    impl Accelerator for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn start(&mut self) -> anyhow::Result<()> {
            self.0.borrow_mut().push("start");
            anyhow::bail!("no hardware")
        }

        fn stop(&mut self) {
            self.0.borrow_mut().push("stop");
        }
    }

    #[test]
    fn test_guard_stops_on_drop() {
        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let _guard = AcceleratorGuard::start(Recording(events.clone()));
            assert_eq!(*events.borrow(), vec!["start"]);
        }
        assert_eq!(*events.borrow(), vec!["start", "stop"]);
    }

    #[test]
    fn test_noop() {
        let _guard = AcceleratorGuard::start(NoopAccelerator);
    }
}
