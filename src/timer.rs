use crate::message_id::MessageId;

/// What a per-message timer is armed for. Resend and Ping fire repeatedly and are pushed
///  back by progress signals, Timeout fires once and bounds the message's total lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Resend,
    Ping,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub id: MessageId,
    pub kind: TimerKind,
    pub deadline: u64,
}

/// A wheel of tick-indexed bins holding per-message timers.
///
/// Entries are binned by `deadline % num_slots`; advancing the wheel drains every bin the
/// tick counter passes and re-bins entries whose deadline lies a full wheel turn (or more)
/// ahead. Cancellation and rescheduling are lazy: owners keep the authoritative deadline in
/// their per-message state and simply discard expired entries that no longer match it, so
/// the wheel never needs to support removal.
pub struct TimerWheel {
    slots: Vec<Vec<TimerEntry>>,
    current_tick: u64,
}

impl TimerWheel {
    pub fn new(num_slots: usize) -> TimerWheel {
        assert!(num_slots.is_power_of_two(), "slot count must be a power of two");
        TimerWheel {
            slots: (0..num_slots).map(|_| Vec::new()).collect(),
            current_tick: 0,
        }
    }

    fn slot_index(&self, tick: u64) -> usize {
        (tick & (self.slots.len() as u64 - 1)) as usize
    }

    pub fn schedule(&mut self, id: MessageId, kind: TimerKind, deadline: u64) {
        let deadline = deadline.max(self.current_tick + 1);
        let slot = self.slot_index(deadline);
        self.slots[slot].push(TimerEntry { id, kind, deadline });
    }

    /// Advances the wheel to `now`, appending all entries whose deadline has passed to
    ///  `expired`. Entries that merely aliased into a passed bin are re-binned.
    pub fn advance(&mut self, now: u64, expired: &mut Vec<TimerEntry>) {
        if now <= self.current_tick {
            return;
        }

        let num_slots = self.slots.len() as u64;
        let first = self.current_tick + 1;
        // a jump of a full turn or more passes every bin exactly once
        let last = if now - self.current_tick >= num_slots { first + num_slots - 1 } else { now };

        for tick in first..=last {
            let slot = self.slot_index(tick);
            let drained = std::mem::take(&mut self.slots[slot]);
            for entry in drained {
                if entry.deadline <= now {
                    expired.push(entry);
                }
                else {
                    let slot = self.slot_index(entry.deadline);
                    self.slots[slot].push(entry);
                }
            }
        }

        self.current_tick = now;
    }
}
