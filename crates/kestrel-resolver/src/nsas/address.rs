//! A single nameserver address and its smoothed round-trip time.

use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// RTT assigned to an address that did not answer at all.
pub const UNREACHABLE_RTT: i64 = i64::MAX;

/// One address of a nameserver.
#[derive(Debug)]
pub struct AddressEntry {
    addr: SocketAddr,
    rtt_nanos: AtomicI64,
}

impl AddressEntry {
    /// Creates an entry with a tiny random RTT so that ties between fresh
    /// addresses break randomly.
    pub fn new(addr: SocketAddr) -> Self {
        let initial = rand::thread_rng().gen_range(0..10);
        Self::with_rtt(addr, initial)
    }

    pub(crate) fn with_rtt(addr: SocketAddr, rtt_nanos: i64) -> Self {
        Self {
            addr,
            rtt_nanos: AtomicI64::new(rtt_nanos),
        }
    }

    /// Socket address of this entry.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current smoothed RTT.
    pub fn rtt(&self) -> Duration {
        Duration::from_nanos(self.rtt_nanos.load(Ordering::Relaxed).max(0) as u64)
    }

    /// Folds a new sample into the smoothed RTT: `(old * 7 + sample * 3) / 10`.
    pub fn update_rtt(&self, sample: Duration) {
        let sample = i64::try_from(sample.as_nanos()).unwrap_or(UNREACHABLE_RTT);
        self.fold(sample);
    }

    /// Marks the address as not answering.
    pub fn set_unreachable(&self) {
        self.fold(UNREACHABLE_RTT);
    }

    fn fold(&self, sample: i64) {
        let _ = self
            .rtt_nanos
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                let smoothed = (old as i128 * 7 + sample as i128 * 3) / 10;
                Some(smoothed.clamp(0, UNREACHABLE_RTT as i128) as i64)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.1:53".parse().unwrap()
    }

    #[test]
    fn test_initial_rtt_is_tiny() {
        for _ in 0..32 {
            assert!(AddressEntry::new(addr()).rtt() < Duration::from_nanos(10));
        }
    }

    #[test]
    fn test_smoothing() {
        let entry = AddressEntry::with_rtt(addr(), 0);
        entry.update_rtt(Duration::from_millis(100));
        assert_eq!(entry.rtt(), Duration::from_millis(30));
        entry.update_rtt(Duration::from_millis(100));
        assert_eq!(entry.rtt(), Duration::from_millis(51));
    }

    #[test]
    fn test_unreachable_does_not_overflow() {
        let entry = AddressEntry::with_rtt(addr(), UNREACHABLE_RTT);
        entry.set_unreachable();
        entry.set_unreachable();
        assert_eq!(entry.rtt(), Duration::from_nanos(UNREACHABLE_RTT as u64));
    }
}
