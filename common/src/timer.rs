#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OffTimer,
    FailsafeRecheck,
    DriftCheck,
}

impl TimerKind {
    const ALL: [Self; 3] = [Self::OffTimer, Self::FailsafeRecheck, Self::DriftCheck];

    fn index(self) -> usize {
        match self {
            Self::OffTimer => 0,
            Self::FailsafeRecheck => 1,
            Self::DriftCheck => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OffTimer => "off-timer",
            Self::FailsafeRecheck => "failsafe-recheck",
            Self::DriftCheck => "drift-check",
        }
    }
}

/// A timer firing, delivered to the engine as an ordinary event. The
/// generation is compared against the live slot so firings that outlived a
/// cancel or re-arm are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u64,
    // None while a single-shot firing is in flight.
    deadline_ms: Option<u64>,
    period_ms: Option<u64>,
}

/// One single-shot or periodic timer per [`TimerKind`]. Deadlines are in the
/// same monotonic milliseconds the engine runs on; the host only sleeps until
/// [`Timers::next_deadline_ms`] and drains [`Timers::take_due`].
#[derive(Debug, Clone, Default)]
pub struct Timers {
    slots: [Option<Slot>; 3],
    next_generation: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(&mut self, kind: TimerKind, delay_ms: u64, now_ms: u64) -> TimerFired {
        self.arm(kind, now_ms.saturating_add(delay_ms), None)
    }

    pub fn every(&mut self, kind: TimerKind, interval_ms: u64, now_ms: u64) -> TimerFired {
        let interval_ms = interval_ms.max(1);
        self.arm(kind, now_ms.saturating_add(interval_ms), Some(interval_ms))
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.slots[kind.index()].take().is_some()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    pub fn deadline_ms(&self, kind: TimerKind) -> Option<u64> {
        self.slots[kind.index()].and_then(|slot| slot.deadline_ms)
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|slot| slot.deadline_ms)
            .min()
    }

    /// Collects every firing due at `now_ms`. Periodic timers are advanced to
    /// their next deadline; single-shot timers stay in flight until accepted.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<TimerFired> {
        let mut fired = Vec::new();
        for kind in TimerKind::ALL {
            let Some(slot) = self.slots[kind.index()].as_mut() else {
                continue;
            };
            let Some(deadline) = slot.deadline_ms else {
                continue;
            };
            if deadline > now_ms {
                continue;
            }

            slot.deadline_ms = slot.period_ms.map(|period| {
                let next = deadline.saturating_add(period);
                if next <= now_ms {
                    now_ms.saturating_add(period)
                } else {
                    next
                }
            });
            fired.push(TimerFired {
                kind,
                generation: slot.generation,
            });
        }
        fired
    }

    /// Returns true when the firing belongs to the live arm of its timer. An
    /// accepted single-shot firing retires the timer.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        let index = fired.kind.index();
        let Some(slot) = self.slots[index] else {
            return false;
        };
        if slot.generation != fired.generation {
            return false;
        }
        if slot.period_ms.is_none() {
            self.slots[index] = None;
        }
        true
    }

    fn arm(&mut self, kind: TimerKind, deadline_ms: u64, period_ms: Option<u64>) -> TimerFired {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.slots[kind.index()] = Some(Slot {
            generation,
            deadline_ms: Some(deadline_ms),
            period_ms,
        });
        TimerFired { kind, generation }
    }
}
