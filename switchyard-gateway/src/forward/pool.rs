//! Lock-free pool of idle upstream HTTP/1.1 senders.

use std::sync::Arc;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::client::conn::http1::SendRequest;

/// A two-stage hot pool keyed by upstream authority.
///
/// The outer map shards by `host:port`; each entry holds a lock-free queue
/// of idle senders. Senders that went away or are still busy with an
/// earlier exchange are discarded on pop rather than handed out.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    idle: Arc<DashMap<String, Arc<SegQueue<SendRequest<Full<Bytes>>>>>>,
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops an idle sender for `authority`, if a usable one exists.
    pub fn try_pop(&self, authority: &str) -> Option<SendRequest<Full<Bytes>>> {
        let queue = self.idle.get(authority)?.value().clone();
        while let Some(sender) = queue.pop() {
            if !sender.is_closed() && sender.is_ready() {
                return Some(sender);
            }
        }
        None
    }

    /// Returns a sender to the pool for reuse.
    pub fn push(&self, authority: String, sender: SendRequest<Full<Bytes>>) {
        if sender.is_closed() {
            return;
        }

        let queue = self
            .idle
            .entry(authority)
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .value()
            .clone();
        queue.push(sender);
    }
}
