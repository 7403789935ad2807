//! Per-connection duplex supervisor.
//!
//! Every accepted socket gets one reader thread and one writer thread. The
//! reader configures the socket and then runs the protocol loop supplied as a
//! [`NetProcess`]; the writer drains the outbound queue. Either side, or any
//! other thread, may start the disconnect sequence. It runs at most once:
//! print the reason, half-close the socket, join the *other* worker, clear the
//! queues and mark the connection complete. The owning [`Connection`] may only
//! be dropped after that, and its `Drop` joins the worker that is left.

use crate::{
    config,
    dedup::{DedupCache, Fingerprint, SeenCache, BLOCK_CACHE_CAPACITY, TXN_CACHE_CAPACITY},
    disconnect::{teardown_side, DisconnectFlags, Flag, FlagSnapshot, WorkerSide},
    metrics::RelayMetrics,
    outbound::{Message, OutboundQueue, Priority},
    socket::RelaySocket,
};
use anyhow::{anyhow, Context, Result};
use std::io;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Protocol entry point run once on the reader thread. It reads from the
/// socket through the [`Link`], dispatches, and returns when the socket
/// closes. Fatal protocol or I/O errors are reported by calling one of the
/// `disconnect` methods before returning.
pub trait NetProcess<S: RelaySocket>: Send + 'static {
    fn net_process(self, link: &Link<S>);
}

impl<S, F> NetProcess<S> for F
where
    S: RelaySocket,
    F: FnOnce(&Link<S>) + Send + 'static,
{
    fn net_process(self, link: &Link<S>) {
        self(link)
    }
}

#[derive(Clone)]
pub struct ConnectionOptions {
    pub txn_cache_capacity: NonZeroUsize,
    pub block_cache_capacity: NonZeroUsize,
    /// Sleep per send cycle while the initial throttle is active.
    pub throttle_delay: Duration,
    pub metrics: RelayMetrics,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            txn_cache_capacity: TXN_CACHE_CAPACITY,
            block_cache_capacity: BLOCK_CACHE_CAPACITY,
            throttle_delay: Duration::from_millis(20),
            metrics: RelayMetrics::default(),
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(cfg: &config::Relay, metrics: RelayMetrics) -> Result<Self> {
        Ok(Self {
            txn_cache_capacity: NonZeroUsize::new(cfg.txn_cache_capacity)
                .context("txn_cache_capacity must be non-zero")?,
            block_cache_capacity: NonZeroUsize::new(cfg.block_cache_capacity)
                .context("block_cache_capacity must be non-zero")?,
            throttle_delay: Duration::from_millis(cfg.initial_throttle_ms),
            metrics,
        })
    }
}

#[derive(Default)]
struct Workers {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    reader_id: Option<ThreadId>,
}

/// State shared by the owner, the reader thread and the writer thread.
pub struct ConnectionCore<S> {
    socket: S,
    host: String,
    flags: DisconnectFlags,
    outbound: Mutex<OutboundQueue>,
    writer_wake: Condvar,
    txn_seen: Mutex<DedupCache>,
    blocks_seen: Mutex<DedupCache>,
    workers: Mutex<Workers>,
    complete: Mutex<bool>,
    complete_cv: Condvar,
    throttle_delay: Duration,
    metrics: RelayMetrics,
}

// Every critical section leaves its data consistent, so a poisoned lock is
// still safe to use.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: RelaySocket> ConnectionCore<S> {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn flags(&self) -> FlagSnapshot {
        self.flags.snapshot()
    }

    pub fn is_complete(&self) -> bool {
        self.flags().contains(Flag::Complete)
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Queue `message` for the writer. Returns `false` (and drops the message)
    /// once a disconnect has begun.
    pub fn enqueue(&self, priority: Priority, message: Message) -> bool {
        self.enqueue_batch(priority, std::iter::once(message))
    }

    /// Queue several messages under one lock acquisition, so the writer sees
    /// them as a single backlog.
    pub fn enqueue_batch<I>(&self, priority: Priority, messages: I) -> bool
    where
        I: IntoIterator<Item = Message>,
    {
        let mut outbound = lock(&self.outbound);
        if !self.flags().is_empty() {
            let dropped = messages.into_iter().count() as u64;
            self.metrics.messages_dropped.inc_by(dropped);
            return false;
        }
        for message in messages {
            outbound.push(priority, message);
        }
        self.writer_wake.notify_all();
        true
    }

    pub fn queued_messages(&self) -> usize {
        lock(&self.outbound).len()
    }

    pub fn waiting_size(&self) -> usize {
        lock(&self.outbound).waiting_size()
    }

    fn seen(&self, cache: SeenCache) -> &Mutex<DedupCache> {
        match cache {
            SeenCache::Transactions => &self.txn_seen,
            SeenCache::Blocks => &self.blocks_seen,
        }
    }

    /// Record `fp` as relayed. Returns `true` the first time it is seen.
    pub fn remember(&self, cache: SeenCache, fp: Fingerprint) -> bool {
        lock(self.seen(cache)).insert(fp)
    }

    pub fn has_seen(&self, cache: SeenCache, fp: &Fingerprint) -> bool {
        lock(self.seen(cache)).contains(fp)
    }

    pub fn seen_len(&self, cache: SeenCache) -> usize {
        lock(self.seen(cache)).len()
    }

    /// Stop traffic now without joining anything. Safe from any context,
    /// including ones that must not block. Thread and queue cleanup still
    /// needs a full [`disconnect`](Self::disconnect) later; the writer runs
    /// one itself the next time it wakes.
    pub fn disconnect_from_outside(&self, reason: &str) {
        self.print_and_close(reason, None);
    }

    pub fn disconnect_from_outside_on_error(&self, reason: &str, err: &io::Error) {
        self.print_and_close(reason, Some(err));
    }

    /// Run the full disconnect sequence. Only the first caller does anything;
    /// it returns once the other worker has been joined.
    pub fn disconnect(&self, reason: &str) {
        self.disconnect_inner(reason, None);
    }

    pub fn disconnect_on_error(&self, reason: &str, err: &io::Error) {
        self.disconnect_inner(reason, Some(err));
    }

    fn print_and_close(&self, reason: &str, cause: Option<&io::Error>) {
        if self.flags.test_and_set(Flag::PrintAndClose) {
            return;
        }
        match cause {
            Some(err) => println!("{} Disconnect: {} ({})", self.host, reason, err),
            None => println!("{} Disconnect: {}", self.host, reason),
        }
        self.metrics.disconnects.inc();
        if let Err(e) = self.socket.shutdown() {
            relay_log!("⚠️  {} socket shutdown failed: {}", self.host, e);
        }
    }

    fn disconnect_inner(&self, reason: &str, cause: Option<&io::Error>) {
        if self.flags.test_and_set(Flag::Started) {
            return;
        }
        self.print_and_close(reason, cause);

        let other = {
            let mut workers = lock(&self.workers);
            if workers.reader_id != Some(thread::current().id()) {
                self.flags.set(Flag::FromWriteThread);
                workers.reader.take()
            } else {
                self.flags.set(Flag::FromReadThread);
                workers.writer.take()
            }
        };

        {
            // The writer may be parked on the condvar with nothing queued.
            let mut outbound = lock(&self.outbound);
            outbound.wake();
            self.writer_wake.notify_all();
        }

        if let Some(handle) = other {
            if handle.join().is_err() {
                eprintln!("🔥 {} worker thread panicked", self.host);
            }
        }

        lock(&self.outbound).clear();
        self.flags.set(Flag::Complete);
        *lock(&self.complete) = true;
        self.complete_cv.notify_all();
    }
}

impl<S: RelaySocket> ConnectionCore<S> {
    fn new(socket: S, host: String, options: ConnectionOptions) -> Self {
        Self {
            socket,
            host,
            flags: DisconnectFlags::new(),
            outbound: Mutex::new(OutboundQueue::new()),
            writer_wake: Condvar::new(),
            txn_seen: Mutex::new(DedupCache::new(options.txn_cache_capacity)),
            blocks_seen: Mutex::new(DedupCache::new(options.block_cache_capacity)),
            workers: Mutex::new(Workers::default()),
            complete: Mutex::new(false),
            complete_cv: Condvar::new(),
            throttle_delay: options.throttle_delay,
            metrics: options.metrics,
        }
    }
}

/// Tear down a connection whose writer never started. The reader may already
/// have run the disconnect itself (its join found no writer), in which case
/// our call is a no-op and the reader handle is still ours to join.
fn abandon_start<S: RelaySocket>(core: &ConnectionCore<S>, err: &io::Error) {
    core.disconnect_on_error("failed to start writer", err);
    let reader = lock(&core.workers).reader.take();
    if let Some(handle) = reader {
        if handle.join().is_err() {
            eprintln!("🔥 {} worker thread panicked", core.host);
        }
    }
}

fn write_loop<S: RelaySocket>(core: Arc<ConnectionCore<S>>) {
    loop {
        let message = {
            let mut outbound = lock(&core.outbound);
            while outbound.is_idle() {
                outbound = core
                    .writer_wake
                    .wait(outbound)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            if !core.flags().is_empty() {
                drop(outbound);
                return core.disconnect("disconnect started elsewhere");
            }

            let Some(next) = outbound.pop() else { continue };
            if next.throttle {
                // Caps the initial burst at roughly 5 Mbps worst case.
                core.metrics.throttled_sends.inc();
                thread::sleep(core.throttle_delay);
            }
            next.message
        };

        match core.socket.send_all(&message) {
            Ok(sent) if sent == message.len() => {
                core.metrics.messages_sent.inc();
                core.metrics.bytes_sent.inc_by(sent as u64);
            }
            Ok(_) => return core.disconnect("failed to send msg"),
            Err(e) => return core.disconnect_on_error("failed to send msg", &e),
        }
    }
}

fn setup_and_read<S, P>(core: Arc<ConnectionCore<S>>, process: P)
where
    S: RelaySocket,
    P: NetProcess<S>,
{
    if let Err(e) = core.socket.configure() {
        return core.disconnect_on_error("error during connect", &e);
    }
    let link = Link { core };
    process.net_process(&link);
    // A loop that simply returned still owes the full sequence, or an idle
    // writer would never be released. No-op if it already ran.
    link.disconnect("read loop exited");
}

/// The reader thread's view of its connection, lent to [`NetProcess`] for the
/// duration of the protocol loop.
pub struct Link<S: RelaySocket> {
    core: Arc<ConnectionCore<S>>,
}

impl<S: RelaySocket> Link<S> {
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.socket.recv(buf)
    }
}

impl<S: RelaySocket> Deref for Link<S> {
    type Target = ConnectionCore<S>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

/// Owner handle for one relay connection.
///
/// Dropping it before [`is_complete`](ConnectionCore::is_complete) reports
/// `true` aborts the process: the thread bookkeeping cannot be trusted then.
pub struct Connection<S: RelaySocket> {
    core: Arc<ConnectionCore<S>>,
}

impl<S: RelaySocket> Connection<S> {
    /// Take ownership of a connected socket and start both workers.
    pub fn spawn<P>(socket: S, host: impl Into<String>, options: ConnectionOptions, process: P) -> Result<Self>
    where
        P: NetProcess<S>,
    {
        let host = host.into();
        let core = Arc::new(ConnectionCore::new(socket, host.clone(), options));

        // Workers that disconnect straight away block on this lock until both
        // handles are in place.
        let mut workers = lock(&core.workers);

        let reader_core = core.clone();
        let reader = thread::Builder::new()
            .name(format!("relay-read-{}", host))
            .spawn(move || setup_and_read(reader_core, process))
            .with_context(|| format!("spawning reader thread for {}", host))?;
        workers.reader_id = Some(reader.thread().id());
        workers.reader = Some(reader);

        let writer_core = core.clone();
        match thread::Builder::new()
            .name(format!("relay-write-{}", host))
            .spawn(move || write_loop(writer_core))
        {
            Ok(writer) => workers.writer = Some(writer),
            Err(e) => {
                drop(workers);
                abandon_start(&core, &e);
                return Err(anyhow!("spawning writer thread for {}: {}", host, e));
            }
        }
        drop(workers);

        core.metrics.connections.inc();
        relay_log!("🤝 {} connected", host);
        Ok(Self { core })
    }

    /// Block until the disconnect sequence has completed or `timeout` passes.
    pub fn wait_complete(&self, timeout: Duration) -> bool {
        let done = lock(&self.core.complete);
        let (done, _) = self
            .core
            .complete_cv
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }
}

impl<S: RelaySocket> Deref for Connection<S> {
    type Target = ConnectionCore<S>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl<S: RelaySocket> Drop for Connection<S> {
    fn drop(&mut self) {
        let side = match teardown_side(self.core.flags()) {
            Ok(side) => side,
            Err(e) => {
                eprintln!("🔥 {}: {:#}", self.core.host, e);
                std::process::abort();
            }
        };

        let handle = {
            let mut workers = lock(&self.core.workers);
            match side {
                WorkerSide::Reader => workers.reader.take(),
                WorkerSide::Writer => workers.writer.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                eprintln!("🔥 {} worker thread panicked", self.core.host);
            }
        }

        self.core.metrics.connections.dec();
        relay_log!("👋 {} connection released", self.core.host);
        // Both workers are gone, so this is the last reference: the socket
        // closes with it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct NullSocket;

    impl RelaySocket for NullSocket {
        fn configure(&self) -> io::Result<()> {
            Ok(())
        }

        fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn send_all(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_writer_start_joins_reader_that_already_disconnected() {
        let core = Arc::new(ConnectionCore::new(NullSocket, "peer-nowriter".into(), ConnectionOptions::default()));
        let finished = Arc::new(AtomicBool::new(false));

        let mut workers = lock(&core.workers);
        let reader_core = core.clone();
        let reader_finished = finished.clone();
        let reader = thread::spawn(move || {
            reader_core.disconnect("error during connect");
            thread::sleep(Duration::from_millis(50));
            reader_finished.store(true, Ordering::SeqCst);
        });
        workers.reader_id = Some(reader.thread().id());
        workers.reader = Some(reader);
        drop(workers);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !core.is_complete() {
            assert!(Instant::now() < deadline, "reader never completed its disconnect");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(core.flags().contains(Flag::FromReadThread));

        abandon_start(&core, &io::Error::new(io::ErrorKind::Other, "no threads left"));
        assert!(finished.load(Ordering::SeqCst), "reader must be joined, not detached");
        assert!(lock(&core.workers).reader.is_none());
        assert_eq!(core.metrics.disconnects.get(), 1);
    }

    #[test]
    fn failed_writer_start_runs_disconnect_itself() {
        let core = Arc::new(ConnectionCore::new(NullSocket, "peer-nowriter-2".into(), ConnectionOptions::default()));
        let reader_core = core.clone();
        let reader = thread::spawn(move || {
            let _ = reader_core.socket.recv(&mut [0u8; 4]);
        });
        {
            let mut workers = lock(&core.workers);
            workers.reader_id = Some(reader.thread().id());
            workers.reader = Some(reader);
        }

        abandon_start(&core, &io::Error::new(io::ErrorKind::Other, "no threads left"));
        let flags = core.flags();
        assert!(flags.contains(Flag::Complete));
        assert!(flags.contains(Flag::FromWriteThread));
        assert!(lock(&core.workers).reader.is_none());
    }
}
