//! Frame delivery: callback dispatch thread and the poll API

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Frame, Phase, StreamShared};
use crate::error::{Result, UvcError};

/// User callback invoked once per published frame.
pub type FrameCallback = Box<dyn FnMut(&Frame) + Send + 'static>;

/// How long [`StreamHandle::get_frame`](super::StreamHandle::get_frame)
/// waits for a new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeout {
    /// Return `None` right away
    NoWait,
    /// Block until a frame arrives
    Forever,
    /// Give up with [`UvcError::Timeout`] after this long
    After(Duration),
}

/// Microsecond convention: negative means don't wait, zero waits forever.
impl From<i32> for PollTimeout {
    fn from(us: i32) -> Self {
        match us {
            i32::MIN..=-1 => PollTimeout::NoWait,
            0 => PollTimeout::Forever,
            us => PollTimeout::After(Duration::from_micros(us as u64)),
        }
    }
}

impl From<Duration> for PollTimeout {
    fn from(timeout: Duration) -> Self {
        PollTimeout::After(timeout)
    }
}

pub(crate) fn spawn_dispatch(
    shared: Arc<StreamShared>,
    callback: FrameCallback,
    last_seen: u64,
) -> std::io::Result<JoinHandle<()>> {
    let cpu = shared.settings.dispatch_cpu;
    thread::Builder::new()
        .name(format!("uvc-dispatch-{}", shared.interface))
        .spawn(move || {
            if let Some(cpu) = cpu {
                pin_to_core(cpu);
            }
            run_dispatch(&shared, callback, last_seen);
        })
}

fn pin_to_core(cpu: usize) {
    let core = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().find(|c| c.id == cpu));
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!(cpu, "dispatch thread pinned");
        }
        _ => warn!(cpu, "could not pin dispatch thread"),
    }
}

fn run_dispatch(shared: &StreamShared, mut callback: FrameCallback, mut last_seen: u64) {
    info!(interface = shared.interface, "dispatch thread started");
    loop {
        let frame = {
            let state = shared.lock();
            let state = shared
                .frame_ready
                .wait_while(state, |s| {
                    s.phase == Phase::Running && s.reassembler.held_sequence() == last_seen
                })
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.phase != Phase::Running {
                break;
            }
            last_seen = state.reassembler.held_sequence();
            state.frame()
        };
        callback(&frame);
    }
    info!(interface = shared.interface, "dispatch thread stopped");
}

impl StreamShared {
    /// Newest frame not yet returned to a poller, waiting per `timeout`.
    pub(crate) fn poll_frame(&self, timeout: PollTimeout) -> Result<Option<Frame>> {
        let state = self.lock();
        if state.phase != Phase::Running {
            return Err(UvcError::InvalidState {
                expected: Phase::Running.as_str(),
                actual: state.phase.as_str(),
            });
        }
        if state.has_callback {
            return Err(UvcError::CallbackExists);
        }

        let last_polled = state.last_polled;
        let waiting = |s: &mut super::StreamState| {
            s.phase == Phase::Running && s.reassembler.held_sequence() == last_polled
        };

        let mut state = if state.reassembler.held_sequence() != last_polled {
            state
        } else {
            match timeout {
                PollTimeout::NoWait => return Ok(None),
                PollTimeout::Forever => self
                    .frame_ready
                    .wait_while(state, waiting)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
                PollTimeout::After(duration) => {
                    let (state, result) = self
                        .frame_ready
                        .wait_timeout_while(state, duration, waiting)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    if result.timed_out() {
                        return Err(UvcError::Timeout);
                    }
                    state
                }
            }
        };

        // stopped while we were blocked
        if state.reassembler.held_sequence() == state.last_polled {
            return Ok(None);
        }
        state.last_polled = state.reassembler.held_sequence();
        Ok(Some(state.frame()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microsecond_convention() {
        assert_eq!(PollTimeout::from(-1), PollTimeout::NoWait);
        assert_eq!(PollTimeout::from(0), PollTimeout::Forever);
        assert_eq!(
            PollTimeout::from(2500),
            PollTimeout::After(Duration::from_micros(2500))
        );
    }
}
