use std::time::{Duration, Instant};

/// Minimum-interval gate between summary emissions.
///
/// Purely mechanical: callers ask how long until the gate opens and mark it
/// when they emit. Retractions never consult it.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// Zero when an emission may go out now.
    pub fn ready_in(&self, now: Instant) -> Duration {
        match self.last_emit {
            None => Duration::ZERO,
            Some(last) => (last + self.min_interval).saturating_duration_since(now),
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_emit = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_emission_is_immediate() {
        let gate = RateGate::new(Duration::from_secs(300));
        assert_eq!(gate.ready_in(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn gate_enforces_min_interval() {
        let mut gate = RateGate::new(Duration::from_secs(300));
        let t0 = Instant::now();
        gate.mark(t0);

        let at_150 = gate.ready_in(t0 + Duration::from_secs(150));
        assert_eq!(at_150, Duration::from_secs(150));

        assert_eq!(gate.ready_in(t0 + Duration::from_secs(300)), Duration::ZERO);
    }

    #[test]
    fn marking_again_restarts_the_clock() {
        let mut gate = RateGate::new(Duration::from_secs(300));
        let t0 = Instant::now();
        gate.mark(t0);
        gate.mark(t0 + Duration::from_secs(300));
        assert_eq!(
            gate.ready_in(t0 + Duration::from_secs(450)),
            Duration::from_secs(150)
        );
    }
}
