// Scripted in-memory socket shared by the connection tests
#![allow(dead_code)]

use relaynode::{ConnectionOptions, Link, Message, RelayMetrics, RelaySocket};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    sent: Vec<Vec<u8>>,
    send_attempts: usize,
    shutdowns: usize,
    gate_closed: bool,
    inbound: VecDeque<Vec<u8>>,
    peer_closed: bool,
}

/// Records every send and half-close. `recv` blocks until inbound data is
/// pushed, the peer closes, or the socket is shut down.
#[derive(Default)]
pub struct MockSocket {
    state: Mutex<State>,
    cv: Condvar,
    short_write_on: Option<usize>,
    fail_configure: bool,
}

impl MockSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `n`th send (0-based) writes only half of its buffer.
    pub fn with_short_write_on(mut self, n: usize) -> Self {
        self.short_write_on = Some(n);
        self
    }

    pub fn with_failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    /// Sends block until [`open_gate`](Self::open_gate) or shutdown.
    pub fn with_closed_gate(self) -> Self {
        self.state.lock().unwrap().gate_closed = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn open_gate(&self) {
        self.state().gate_closed = false;
        self.cv.notify_all();
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.state().inbound.push_back(bytes.to_vec());
        self.cv.notify_all();
    }

    pub fn close_peer(&self) {
        self.state().peer_closed = true;
        self.cv.notify_all();
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.state().send_attempts
    }

    pub fn shutdowns(&self) -> usize {
        self.state().shutdowns
    }

    /// Wait until at least `n` send calls have started.
    pub fn wait_for_attempts(&self, n: usize) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut st = self.state();
        while st.send_attempts < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self.cv.wait_timeout(st, deadline - now).unwrap().0;
        }
        true
    }

    /// Wait until at least `n` sends have completed.
    pub fn wait_for_sent(&self, n: usize) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut st = self.state();
        while st.sent.len() < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self.cv.wait_timeout(st, deadline - now).unwrap().0;
        }
        true
    }
}

impl RelaySocket for MockSocket {
    fn configure(&self) -> io::Result<()> {
        if self.fail_configure {
            return Err(io::Error::new(io::ErrorKind::Other, "mock configure failure"));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state();
        loop {
            if let Some(chunk) = st.inbound.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                return Ok(n);
            }
            if st.peer_closed || st.shutdowns > 0 {
                return Ok(0);
            }
            st = self.cv.wait(st).unwrap();
        }
    }

    fn send_all(&self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.state();
        let index = st.send_attempts;
        st.send_attempts += 1;
        self.cv.notify_all();
        while st.gate_closed && st.shutdowns == 0 {
            st = self.cv.wait(st).unwrap();
        }
        if st.shutdowns > 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock socket shut down"));
        }
        let written = if self.short_write_on == Some(index) { buf.len() / 2 } else { buf.len() };
        st.sent.push(buf[..written].to_vec());
        self.cv.notify_all();
        Ok(written)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.state().shutdowns += 1;
        self.cv.notify_all();
        Ok(())
    }
}

pub type MockLink = Link<Arc<MockSocket>>;

pub fn options(metrics: &RelayMetrics, throttle: Duration) -> ConnectionOptions {
    ConnectionOptions {
        throttle_delay: throttle,
        metrics: metrics.clone(),
        ..ConnectionOptions::default()
    }
}

pub fn msg(bytes: &[u8]) -> Message {
    Arc::new(bytes.to_vec())
}

/// Protocol loop that discards input and runs the full disconnect once the
/// socket stops delivering data.
pub fn read_until_closed() -> impl FnOnce(&MockLink) + Send + 'static {
    |link: &MockLink| {
        let mut buf = [0u8; 256];
        loop {
            match link.recv(&mut buf) {
                Ok(0) => return link.disconnect("peer closed connection"),
                Ok(_) => {}
                Err(e) => return link.disconnect_on_error("failed to read", &e),
            }
        }
    }
}
