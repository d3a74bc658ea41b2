/// Back-pressure for the sender pump.
///
/// Bounds the bytes handed to the socket writer but not yet written. `wait`
/// is the only intentionally blocking call on the loader thread; it never
/// blocks past the configured timeout, so a stalled peer slows the sender
/// down without wedging it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Headroom was available (or freed) before the deadline.
    Proceed,
    /// Deadline passed; the bytes were admitted anyway.
    TimedOut,
    /// The conditioner was closed; the caller should stop sending.
    Closed,
}

struct State {
    in_flight: usize,
    closed: bool,
}

pub struct FlowConditioner {
    max_in_flight: usize,
    timeout: Duration,
    state: Mutex<State>,
    headroom: Condvar,
}

impl FlowConditioner {
    pub fn new(max_in_flight: usize, timeout: Duration) -> Self {
        Self {
            max_in_flight,
            timeout,
            state: Mutex::new(State {
                in_flight: 0,
                closed: false,
            }),
            headroom: Condvar::new(),
        }
    }

    /// Block until `n` more bytes fit under the ceiling, the timeout
    /// elapses, or the conditioner is closed.
    ///
    /// A single item larger than the ceiling is admitted once nothing else
    /// is in flight.
    pub fn wait(&self, n: usize) -> Admission {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        let mut admission = Admission::Proceed;

        while !state.closed && state.in_flight > 0 && state.in_flight + n > self.max_in_flight {
            if self.headroom.wait_until(&mut state, deadline).timed_out() {
                admission = Admission::TimedOut;
                break;
            }
        }
        if state.closed {
            return Admission::Closed;
        }

        state.in_flight += n;
        admission
    }

    /// Release `n` bytes after the writer flushed them to the socket.
    pub fn signal(&self, n: usize) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(n);
        self.headroom.notify_all();
    }

    /// Wake every waiter and refuse further admissions.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.headroom.notify_all();
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}
