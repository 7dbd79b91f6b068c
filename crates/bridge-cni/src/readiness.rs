//! Bounded wait for the host-side port to come up.

use crate::error::{CniError, Result};
use cni_types::OperState;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before each probe, in milliseconds.
pub const RETRY_SCHEDULE_MS: [u64; 5] = [0, 50, 500, 1000, 1000];

/// Sleeps then probes on each step of [`RETRY_SCHEDULE_MS`] until `probe`
/// reports [`OperState::Up`].
///
/// A probe error aborts the wait. If the last probe is not up the port is
/// considered broken.
pub fn wait_for_port<P, S>(mut probe: P, sleep: S) -> Result<()>
where
    P: FnMut() -> Result<OperState>,
    S: Fn(Duration),
{
    let mut state = OperState::Unknown;
    for (attempt, delay) in RETRY_SCHEDULE_MS.iter().enumerate() {
        sleep(Duration::from_millis(*delay));
        state = probe()?;
        if state.is_up() {
            debug!(attempt, "Bridge port is up");
            return Ok(());
        }
        debug!(attempt, state = %state, "Bridge port not up yet");
    }

    warn!(state = %state, "Bridge port never came up");
    Err(CniError::ReadinessTimeout(format!(
        "bridge port in error state: {state}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[test]
    fn test_up_immediately() {
        let slept = RefCell::new(Vec::new());
        let mut probes = 0;
        wait_for_port(
            || {
                probes += 1;
                Ok(OperState::Up)
            },
            |d| slept.borrow_mut().push(d.as_millis() as u64),
        )
        .unwrap();
        assert_eq!(probes, 1);
        assert_eq!(*slept.borrow(), vec![0]);
    }

    #[test]
    fn test_up_on_third_probe() {
        let slept = RefCell::new(Vec::new());
        let mut states = [OperState::Down, OperState::LowerLayerDown, OperState::Up].into_iter();
        wait_for_port(
            || Ok(states.next().unwrap_or(OperState::Up)),
            |d| slept.borrow_mut().push(d.as_millis() as u64),
        )
        .unwrap();
        assert_eq!(*slept.borrow(), vec![0, 50, 500]);
    }

    #[test]
    fn test_never_up_fails_after_full_schedule() {
        let slept = RefCell::new(Vec::new());
        let mut probes = 0;
        let err = wait_for_port(
            || {
                probes += 1;
                Ok(OperState::Down)
            },
            |d| slept.borrow_mut().push(d.as_millis() as u64),
        )
        .unwrap_err();
        assert_eq!(probes, 5);
        assert_eq!(*slept.borrow(), RETRY_SCHEDULE_MS.to_vec());
        assert_eq!(err.code(), 104);
        assert_eq!(err.to_string(), "bridge port in error state: down");
    }

    #[test]
    fn test_probe_error_aborts() {
        let mut probes = 0;
        let err = wait_for_port(
            || {
                probes += 1;
                Err(CniError::device("failed to lookup \"vethdeadbeef\": Link not found"))
            },
            |_| {},
        )
        .unwrap_err();
        assert_eq!(probes, 1);
        assert_eq!(err.code(), 102);
    }
}
