//! Sequence counters for RMCP+ sessions.

/// Width of the inbound session-sequence replay window.
pub(crate) const REPLAY_WINDOW: u32 = 32;

/// Sliding window over inbound session sequence numbers.
///
/// A number is accepted if it is ahead of the highest seen by at most the
/// window width, or behind it within the window and not yet seen.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplayWindow {
    highest: u32,
    /// Bit `n` set: `highest - n` has been seen.
    seen: u32,
    started: bool,
}

impl ReplayWindow {
    pub(crate) fn accept(&mut self, seq: u32) -> bool {
        if seq == 0 {
            return false;
        }
        if !self.started {
            self.started = true;
            self.highest = seq;
            self.seen = 1;
            return true;
        }

        let ahead = seq.wrapping_sub(self.highest);
        if ahead == 0 {
            return false;
        }
        if ahead <= REPLAY_WINDOW {
            self.seen = if ahead >= 32 { 0 } else { self.seen << ahead };
            self.seen |= 1;
            self.highest = seq;
            return true;
        }

        let behind = self.highest.wrapping_sub(seq);
        if behind < REPLAY_WINDOW {
            let bit = 1u32 << behind;
            if self.seen & bit != 0 {
                return false;
            }
            self.seen |= bit;
            return true;
        }
        false
    }
}

/// Outbound session sequence numbers: start at 1, skip 0 on wrap.
#[derive(Debug, Clone)]
pub(crate) struct OutboundSequence(u32);

impl OutboundSequence {
    pub(crate) fn new() -> Self {
        Self(1)
    }

    pub(crate) fn next(&mut self) -> u32 {
        let current = self.0;
        self.0 = self.0.wrapping_add(1);
        if self.0 == 0 {
            self.0 = 1;
        }
        current
    }
}

/// 6-bit IPMI requester sequence number.
pub(crate) fn next_rq_seq(seq: u8) -> u8 {
    (seq + 1) & 0x3F
}

/// 4-bit SOL packet sequence number; 0 is reserved for ACK-only packets.
pub(crate) fn next_sol_seq(seq: u8) -> u8 {
    seq % 15 + 1
}
