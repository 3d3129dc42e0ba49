//! Instance-local admission control.
//!
//! A load gate consulted before accepting heavy event-triggered work. The
//! counter is deliberately instance-local and uncoordinated: two instances
//! may both accept concurrently, and correctness under concurrent
//! acceptance belongs to the distributed lock, not to this gate. This is
//! load shedding, nothing more.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Whether the bus should consult the admission gate for a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Heavy work: gated on first delivery, never re-rejected on redelivery.
    Gated,
    /// Cheap or already-throttled work: always admitted.
    Exempt,
}

/// Snapshot explaining an admission decision.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionDecision {
    pub accepted: bool,
    pub in_flight: usize,
    pub ceiling: usize,
}

pub struct AdmissionController {
    in_flight: Arc<AtomicUsize>,
    ceiling: usize,
}

impl AdmissionController {
    pub fn new(ceiling: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            ceiling: ceiling.max(1),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_too_busy(&self) -> bool {
        self.in_flight() >= self.ceiling
    }

    /// Advisory snapshot; racy by design.
    pub fn decide(&self) -> AdmissionDecision {
        let in_flight = self.in_flight();
        AdmissionDecision {
            accepted: in_flight < self.ceiling,
            in_flight,
            ceiling: self.ceiling,
        }
    }

    /// Try to admit one heavy operation. On rejection the decision snapshot
    /// explains why; on admission the returned permit holds a slot until
    /// dropped.
    pub fn begin(&self) -> Result<AdmissionPermit, AdmissionDecision> {
        // Racy check-then-increment is fine here: the ceiling is advisory
        // and an occasional overshoot by one is acceptable.
        let decision = self.decide();
        if !decision.accepted {
            return Err(decision);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(AdmissionPermit {
            in_flight: self.in_flight.clone(),
        })
    }

    /// Admit unconditionally. Used for redelivered messages, which must
    /// make forward progress and are never re-rejected for busyness.
    pub fn begin_forced(&self) -> AdmissionPermit {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        AdmissionPermit {
            in_flight: self.in_flight.clone(),
        }
    }
}

/// RAII slot in the heavy-operation count.
#[derive(Debug)]
pub struct AdmissionPermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_ceiling_then_rejects() {
        let controller = AdmissionController::new(2);

        let first = controller.begin().unwrap();
        let second = controller.begin().unwrap();
        assert!(controller.is_too_busy());

        let rejection = controller.begin().unwrap_err();
        assert!(!rejection.accepted);
        assert_eq!(rejection.in_flight, 2);
        assert_eq!(rejection.ceiling, 2);

        drop(first);
        assert!(!controller.is_too_busy());
        let third = controller.begin().unwrap();
        drop(second);
        drop(third);
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn forced_admission_ignores_the_ceiling() {
        let controller = AdmissionController::new(1);
        let _held = controller.begin().unwrap();
        assert!(controller.is_too_busy());

        let forced = controller.begin_forced();
        assert_eq!(controller.in_flight(), 2);
        drop(forced);
        assert_eq!(controller.in_flight(), 1);
    }
}
