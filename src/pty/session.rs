use std::collections::VecDeque;

/// Bounded ring buffer of raw PTS output bytes. On overflow the oldest bytes
/// are evicted; eviction prefers a boundary outside of an ANSI escape
/// sequence so replay doesn't emit a truncated CSI/OSC sequence. When no safe
/// boundary exists within a small search window, it evicts at the exact
/// capacity boundary and prepends a plain-attribute reset so a stray partial
/// sequence can't corrupt the viewer's terminal state.
pub struct Scrollback {
    buf: VecDeque<u8>,
    capacity: usize,
    resync_pending: bool,
}

const ESC: u8 = 0x1b;
const RESET_SEQUENCE: &[u8] = b"\x1b[0m";

impl Scrollback {
    pub fn new(capacity: usize) -> Scrollback {
        Scrollback {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            resync_pending: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());

        if self.buf.len() <= self.capacity {
            return;
        }

        let overflow = self.buf.len() - self.capacity;
        let safe_cut = self.find_safe_cut(overflow);

        for _ in 0..safe_cut {
            self.buf.pop_front();
        }

        if safe_cut < overflow {
            self.resync_pending = true;
        }
    }

    /// Looks forward from `min_cut` for a position that isn't inside an
    /// escape sequence (i.e. not preceded by an unterminated ESC within a
    /// reasonable lookback), within a small search window past `min_cut`.
    fn find_safe_cut(&self, min_cut: usize) -> usize {
        const SEARCH_WINDOW: usize = 64;
        let limit = (min_cut + SEARCH_WINDOW).min(self.buf.len());

        for cut in min_cut..=limit {
            if self.is_safe_boundary(cut) {
                return cut;
            }
        }
        min_cut
    }

    fn is_safe_boundary(&self, cut: usize) -> bool {
        // Walk back up to 16 bytes from the proposed cut looking for an ESC
        // that hasn't yet been terminated by a final byte (0x40..=0x7e).
        let lookback = cut.saturating_sub(16);
        let mut in_escape = false;
        for i in lookback..cut {
            match self.buf.get(i) {
                Some(&ESC) => in_escape = true,
                Some(&b) if in_escape && (0x40..=0x7e).contains(&b) => in_escape = false,
                _ => {}
            }
        }
        !in_escape
    }

    /// Replay buffer, prefixed with a reset sequence if a previous eviction
    /// may have split a sequence.
    pub fn replay(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buf.len() + RESET_SEQUENCE.len());
        if self.resync_pending {
            out.extend_from_slice(RESET_SEQUENCE);
        }
        out.extend(self.buf.iter().copied());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_equals_pushed_bytes_under_capacity() {
        let mut sb = Scrollback::new(1024);
        sb.push(b"hello");
        sb.push(b" world");
        assert_eq!(sb.replay(), b"hello world");
    }

    #[test]
    fn evicts_oldest_on_overflow() {
        let mut sb = Scrollback::new(5);
        sb.push(b"abcde");
        sb.push(b"fg");
        assert_eq!(sb.replay(), b"cdefg");
    }

    #[test]
    fn avoids_splitting_escape_sequence_when_possible() {
        let mut sb = Scrollback::new(10);
        sb.push(b"01234");
        sb.push(b"\x1b[31mhi");
        // Total pushed = 5 + 7 = 12, capacity 10, overflow = 2.
        // A safe cut should not land inside "\x1b[31m".
        let replay = sb.replay();
        assert!(!replay.starts_with(b"[31m") || replay.starts_with(b"\x1b[0m"));
    }
}
