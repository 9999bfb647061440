use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of offering a frame to an analyser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The frame is now the single frame in flight.
    Admitted,
    /// Another frame was in flight; this one was dropped.
    Rejected,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admitted
    }
}

/// Bits of the ticket reserved for the admission counter.
const COUNTER_BITS: u32 = 16;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Drop-on-busy gate allowing at most one frame in flight.
///
/// The whole state is one atomic word: 0 when idle, otherwise the ticket of
/// the admitted frame. A ticket packs the admission time (milliseconds since
/// the gate was created) above a rolling non-zero counter, so the watchdog
/// can age the in-flight frame from the same word it swaps.
pub struct AdmissionGate {
    state: AtomicU64,
    counter: AtomicU64,
    origin: Instant,
    watchdog: Option<Duration>,
    rejected: AtomicU64,
    forced_resets: AtomicU64,
}

impl AdmissionGate {
    /// `watchdog`: in-flight age after which a new frame may take over.
    pub fn new(watchdog: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU64::new(0),
            counter: AtomicU64::new(0),
            origin: Instant::now(),
            watchdog,
            rejected: AtomicU64::new(0),
            forced_resets: AtomicU64::new(0),
        })
    }

    /// Test-and-set admission. Never blocks.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.try_admit_with(|| true)
    }

    /// Like [`AdmissionGate::try_admit`], but the watchdog only takes over a
    /// stalled frame when `can_take_over` agrees, e.g. when the worker has
    /// room for another job.
    pub fn try_admit_with(
        self: &Arc<Self>,
        can_take_over: impl FnOnce() -> bool,
    ) -> Option<AdmissionPermit> {
        let ticket = self.next_ticket();

        let current = match self
            .state
            .compare_exchange(0, ticket, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return Some(self.permit(ticket, 0)),
            Err(current) => current,
        };

        if self.is_stalled(current)
            && can_take_over()
            && self
                .state
                .compare_exchange(current, ticket, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.forced_resets.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Frame in flight for {}ms exceeded the watchdog; admitting a new frame",
                self.age_ms(current)
            );
            return Some(self.permit(ticket, current));
        }

        self.rejected.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn is_busy(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    /// Frames turned away since the gate was created.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Admissions the watchdog forced over a stalled frame.
    pub fn forced_reset_count(&self) -> u64 {
        self.forced_resets.load(Ordering::Relaxed)
    }

    fn permit(self: &Arc<Self>, ticket: u64, displaced: u64) -> AdmissionPermit {
        AdmissionPermit {
            gate: Arc::clone(self),
            ticket,
            displaced,
            armed: true,
        }
    }

    fn next_ticket(&self) -> u64 {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) % COUNTER_MASK + 1;
        (self.now_ms() << COUNTER_BITS) | count
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn age_ms(&self, ticket: u64) -> u64 {
        self.now_ms().saturating_sub(ticket >> COUNTER_BITS)
    }

    fn is_stalled(&self, ticket: u64) -> bool {
        match self.watchdog {
            Some(timeout) => self.age_ms(ticket) >= timeout.as_millis() as u64,
            None => false,
        }
    }

    fn release(&self, ticket: u64) {
        if self
            .state
            .compare_exchange(ticket, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Stale admission released after a watchdog reset");
        }
    }
}

/// Proof that a frame holds the gate. Dropping it makes the gate idle again,
/// unless the watchdog already handed the gate to a newer frame.
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
    ticket: u64,
    /// Ticket this admission took over from, 0 if the gate was idle.
    displaced: u64,
    armed: bool,
}

impl AdmissionPermit {
    /// False once the watchdog has given the gate to a newer frame.
    pub fn is_current(&self) -> bool {
        self.gate.state.load(Ordering::Acquire) == self.ticket
    }

    /// Undoes an admission whose frame could not be handed to the worker.
    ///
    /// The gate goes back to the frame it was taken from (or idle), and the
    /// frame counts as rejected.
    pub fn hand_back(mut self) {
        self.armed = false;
        let restored = self
            .gate
            .state
            .compare_exchange(
                self.ticket,
                self.displaced,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if restored && self.displaced != 0 {
            self.gate.forced_resets.fetch_sub(1, Ordering::Relaxed);
        }
        self.gate.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.armed {
            self.gate.release(self.ticket);
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("ticket", &self.ticket)
            .field("current", &self.is_current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_first_frame_admitted() {
        let gate = AdmissionGate::new(None);
        let permit = gate.try_admit();
        assert!(permit.is_some());
        assert!(gate.is_busy());
    }

    #[test]
    fn test_second_frame_rejected_while_busy() {
        let gate = AdmissionGate::new(None);
        let _permit = gate.try_admit().unwrap();

        assert!(gate.try_admit().is_none());
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.rejected_count(), 2);
    }

    #[test]
    fn test_dropping_permit_reopens_gate() {
        let gate = AdmissionGate::new(None);
        let permit = gate.try_admit().unwrap();
        drop(permit);

        assert!(!gate.is_busy());
        assert!(gate.try_admit().is_some());
    }

    #[test]
    fn test_permit_is_current_until_released() {
        let gate = AdmissionGate::new(None);
        let permit = gate.try_admit().unwrap();
        assert!(permit.is_current());
    }

    #[test]
    fn test_tickets_are_never_zero() {
        let gate = AdmissionGate::new(None);
        for _ in 0..(COUNTER_MASK + 3) {
            assert_ne!(gate.next_ticket(), 0);
        }
    }

    #[test]
    fn test_without_watchdog_stalled_frame_keeps_gate() {
        let gate = AdmissionGate::new(None);
        let _permit = gate.try_admit().unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(gate.try_admit().is_none());
        assert_eq!(gate.forced_reset_count(), 0);
    }

    #[test]
    fn test_watchdog_admits_over_stalled_frame() {
        let gate = AdmissionGate::new(Some(Duration::from_millis(20)));
        let stalled = gate.try_admit().unwrap();
        thread::sleep(Duration::from_millis(40));

        let fresh = gate.try_admit().expect("watchdog should admit");

        assert_eq!(gate.forced_reset_count(), 1);
        assert!(!stalled.is_current());
        assert!(fresh.is_current());
    }

    #[test]
    fn test_watchdog_waits_until_take_over_allowed() {
        let gate = AdmissionGate::new(Some(Duration::from_millis(20)));
        let stalled = gate.try_admit().unwrap();
        thread::sleep(Duration::from_millis(40));

        assert!(gate.try_admit_with(|| false).is_none());
        assert!(stalled.is_current());
        assert_eq!(gate.forced_reset_count(), 0);
        assert_eq!(gate.rejected_count(), 1);

        assert!(gate.try_admit_with(|| true).is_some());
        assert_eq!(gate.forced_reset_count(), 1);
    }

    #[test]
    fn test_hand_back_reopens_idle_gate_and_counts_rejection() {
        let gate = AdmissionGate::new(None);
        let permit = gate.try_admit().unwrap();

        permit.hand_back();

        assert!(!gate.is_busy());
        assert_eq!(gate.rejected_count(), 1);
    }

    #[test]
    fn test_hand_back_restores_taken_over_frame() {
        let gate = AdmissionGate::new(Some(Duration::from_millis(20)));
        let stalled = gate.try_admit().unwrap();
        thread::sleep(Duration::from_millis(40));
        let fresh = gate.try_admit().unwrap();

        fresh.hand_back();

        assert!(stalled.is_current());
        assert_eq!(gate.forced_reset_count(), 0);
        assert_eq!(gate.rejected_count(), 1);
        drop(stalled);
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_watchdog_does_not_fire_before_timeout() {
        let gate = AdmissionGate::new(Some(Duration::from_secs(60)));
        let _permit = gate.try_admit().unwrap();
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.forced_reset_count(), 0);
    }

    #[test]
    fn test_stale_permit_does_not_release_newer_admission() {
        let gate = AdmissionGate::new(Some(Duration::from_millis(20)));
        let stalled = gate.try_admit().unwrap();
        thread::sleep(Duration::from_millis(40));
        let fresh = gate.try_admit().unwrap();

        drop(stalled);

        assert!(gate.is_busy());
        assert!(fresh.is_current());
        drop(fresh);
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_at_most_one_frame_in_flight_under_contention() {
        let gate = AdmissionGate::new(None);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(permit) = gate.try_admit() {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            admitted.fetch_add(1, Ordering::SeqCst);
                            thread::yield_now();
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            drop(permit);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        let total = admitted.load(Ordering::SeqCst) as u64 + gate.rejected_count();
        assert_eq!(total, 8 * 500);
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_admission_is_admitted() {
        assert!(Admission::Admitted.is_admitted());
        assert!(!Admission::Rejected.is_admitted());
    }
}
