use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use crossbeam_channel as channel;
use dashmap::DashMap;
use tracing::info;

/// Outcome of one push to every observer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub delivered: usize,
    /// Queue full: the observer stopped reading.
    pub slow: usize,
    /// Writer already gone.
    pub gone: usize,
}

impl PushSummary {
    pub fn dropped(&self) -> usize {
        self.slow + self.gone
    }
}

/// Connected snapshot observers, each fed through its own bounded queue.
pub struct ObserverSet {
    observers: DashMap<SocketAddr, channel::Sender<Bytes>>,
    dropped_total: AtomicU64,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self {
            observers: DashMap::new(),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register an observer; `first` is queued ahead of any periodic push.
    pub fn join(&self, addr: SocketAddr, tx: channel::Sender<Bytes>, first: Option<Bytes>) {
        if let Some(frame) = first {
            let _ = tx.try_send(frame);
        }
        self.observers.insert(addr, tx);
    }

    pub fn leave(&self, addr: &SocketAddr) -> bool {
        self.observers.remove(addr).is_some()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.observers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Observers dropped by pushes since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn dispose(&self) {
        self.observers.clear();
    }

    /// Queue `frame` for every observer. Slow or vanished observers are
    /// dropped without affecting delivery to the rest.
    pub fn push(&self, frame: &Bytes) -> PushSummary {
        let mut summary = PushSummary::default();
        self.observers.retain(|addr, tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                summary.delivered += 1;
                true
            }
            Err(channel::TrySendError::Full(_)) => {
                info!(%addr, "Observer is not keeping up, dropping it");
                summary.slow += 1;
                false
            }
            Err(channel::TrySendError::Disconnected(_)) => {
                summary.gone += 1;
                false
            }
        });
        self.dropped_total
            .fetch_add(summary.dropped() as u64, Ordering::Relaxed);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn join_queues_first_frame_before_pushes() {
        let (tx, rx) = channel::bounded::<Bytes>(4);
        let set = ObserverSet::new();
        set.join(addr(9000), tx, Some(Bytes::from_static(b"first\n")));
        set.push(&Bytes::from_static(b"second\n"));

        assert_eq!(rx.recv().unwrap(), Bytes::from_static(b"first\n"));
        assert_eq!(rx.recv().unwrap(), Bytes::from_static(b"second\n"));
    }

    #[test]
    fn push_summarises_slow_and_vanished_observers() {
        let (tx_live, rx_live) = channel::bounded::<Bytes>(1);
        let (tx_slow, _rx_slow) = channel::bounded::<Bytes>(1);
        let (tx_gone, rx_gone) = channel::bounded::<Bytes>(1);
        drop(rx_gone);

        let set = ObserverSet::new();
        set.join(addr(9100), tx_live, None);
        // already holds one unread frame
        set.join(addr(9101), tx_slow, Some(Bytes::from_static(b"stale")));
        set.join(addr(9102), tx_gone, None);

        let summary = set.push(&Bytes::from_static(b"{}\n"));
        assert_eq!(summary, PushSummary { delivered: 1, slow: 1, gone: 1 });
        assert_eq!(rx_live.recv().unwrap(), Bytes::from_static(b"{}\n"));
        assert!(set.contains(&addr(9100)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.dropped_total(), 2);

        assert_eq!(set.push(&Bytes::from_static(b"{}\n")).dropped(), 0);
        assert_eq!(set.dropped_total(), 2);
    }

    #[test]
    fn leave_and_dispose() {
        let (tx1, _rx1) = channel::unbounded::<Bytes>();
        let (tx2, _rx2) = channel::unbounded::<Bytes>();
        let set = ObserverSet::new();
        set.join(addr(9200), tx1, None);
        set.join(addr(9201), tx2, None);

        assert!(set.leave(&addr(9200)));
        assert!(!set.leave(&addr(9200)));
        set.dispose();
        assert!(set.is_empty());
    }
}
