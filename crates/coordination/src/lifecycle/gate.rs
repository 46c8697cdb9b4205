//! Local admission control for a worker's backend
//!
//! The store tells brokers not to pick a draining worker; the gate makes the
//! worker itself refuse new sessions once draining, and counts the sessions
//! still open so the drain wait knows when it is done.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-flight session counter with an accepting flag
///
/// Uses atomic operations for thread-safe access without locks.
///
/// # Example
///
/// ```
/// use browserfleet_coordination::lifecycle::AdmissionGate;
///
/// let gate = AdmissionGate::new();
/// let permit = gate.try_admit().expect("gate is open");
/// assert_eq!(gate.in_flight(), 1);
///
/// gate.close();
/// assert!(gate.try_admit().is_none());
///
/// drop(permit);
/// assert_eq!(gate.in_flight(), 0);
/// ```
#[derive(Debug)]
pub struct AdmissionGate {
    in_flight: AtomicUsize,
    accepting: AtomicBool,
}

impl AdmissionGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
        })
    }

    /// Admit one session, or refuse it when the gate is closed
    ///
    /// The session counts as in flight until the permit is dropped.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        // Count first so a concurrent close() never misses an admitted session.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(AdmissionPermit {
            gate: Arc::clone(self),
        })
    }

    /// Stop admitting sessions; open ones are unaffected
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Sessions admitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Proof of admission; dropping it ends the session's accounting
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permits_count_in_flight() {
        let gate = AdmissionGate::new();
        let a = gate.try_admit().unwrap();
        let b = gate.try_admit().unwrap();
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_closed_gate_refuses_without_leaking_count() {
        let gate = AdmissionGate::new();
        let open = gate.try_admit().unwrap();
        gate.close();

        assert!(!gate.is_accepting());
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.in_flight(), 1);

        drop(open);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_admission() {
        let gate = AdmissionGate::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _permit = gate.try_admit();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.in_flight(), 0);
    }
}
