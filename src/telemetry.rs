//! Process-wide counters for contained failures and data-plane outcomes.
//!
//! Increments are relaxed atomics; a [`CountersSnapshot`] is a point-in-time
//! copy suitable for the control API.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counters {
    pub transport_errors: AtomicU64,
    pub protocol_violations: AtomicU64,
    /// Unit frames dropped by a full send queue or an undersized MTU.
    pub frames_dropped: AtomicU64,
    pub no_route: AtomicU64,
    pub unreachable_service: AtomicU64,
    pub hop_limit_exceeded: AtomicU64,
    /// Unit messages suppressed by the recently-seen set.
    pub duplicates: AtomicU64,
    pub delivered: AtomicU64,
    pub forwarded: AtomicU64,
    pub advertisements_accepted: AtomicU64,
    pub advertisements_suppressed: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub transport_errors: u64,
    pub protocol_violations: u64,
    pub frames_dropped: u64,
    pub no_route: u64,
    pub unreachable_service: u64,
    pub hop_limit_exceeded: u64,
    pub duplicates: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub advertisements_accepted: u64,
    pub advertisements_suppressed: u64,
}

#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            transport_errors: read(&self.transport_errors),
            protocol_violations: read(&self.protocol_violations),
            frames_dropped: read(&self.frames_dropped),
            no_route: read(&self.no_route),
            unreachable_service: read(&self.unreachable_service),
            hop_limit_exceeded: read(&self.hop_limit_exceeded),
            duplicates: read(&self.duplicates),
            delivered: read(&self.delivered),
            forwarded: read(&self.forwarded),
            advertisements_accepted: read(&self.advertisements_accepted),
            advertisements_suppressed: read(&self.advertisements_suppressed),
        }
    }
}
