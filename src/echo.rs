//! Loopback protocol used by the `relay-server` binary: every chunk read from
//! the peer is queued back to it, except chunks already relayed recently.

use crate::{
    connection::{Link, NetProcess},
    dedup::{fingerprint, SeenCache},
    outbound::Priority,
    socket::RelaySocket,
};
use std::sync::Arc;

pub struct EchoProcess {
    read_buffer_bytes: usize,
}

impl EchoProcess {
    pub fn new(read_buffer_bytes: usize) -> Self {
        Self { read_buffer_bytes: read_buffer_bytes.max(1) }
    }
}

impl<S: RelaySocket> NetProcess<S> for EchoProcess {
    fn net_process(self, link: &Link<S>) {
        let mut buf = vec![0u8; self.read_buffer_bytes];
        loop {
            let n = match link.recv(&mut buf) {
                Ok(0) => return link.disconnect("peer closed connection"),
                Ok(n) => n,
                Err(e) => return link.disconnect_on_error("failed to read", &e),
            };
            let chunk = &buf[..n];
            let fp = fingerprint(chunk);
            if !link.remember(SeenCache::Transactions, fp) {
                link.metrics().duplicates_suppressed.inc();
                relay_log!("♻️  {} dropped repeat chunk {}", link.host(), hex::encode(&fp[..8]));
                continue;
            }
            if !link.enqueue(Priority::Secondary, Arc::new(chunk.to_vec())) {
                return link.disconnect("connection shutting down");
            }
        }
    }
}
