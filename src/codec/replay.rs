//! Replay protection for packet nonces.
//!
//! Senders number their packets from 1 upwards. The receiver remembers the
//! highest counter seen and a bitmap of the [WINDOW] counters below it, so
//! mildly reordered packets are still accepted while any exact repeat, or
//! anything older than the window, is refused.

/// Number of counters tracked below the highest one seen.
pub const WINDOW: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("nonce {0} already seen")]
    Duplicate(u64),
    #[error("nonce {counter} is older than the replay window (highest seen {highest})")]
    TooOld { counter: u64, highest: u64 },
    #[error("nonce 0 is never valid")]
    Zero,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: u64,
    /// Bit `i` set means counter `highest - i` has been seen.
    seen: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a counter without recording it.
    pub fn check(&self, counter: u64) -> Result<(), ReplayError> {
        if counter == 0 {
            return Err(ReplayError::Zero);
        }
        if counter > self.highest {
            return Ok(());
        }
        let offset = self.highest - counter;
        if offset >= WINDOW {
            return Err(ReplayError::TooOld {
                counter,
                highest: self.highest,
            });
        }
        if self.seen & (1 << offset) != 0 {
            return Err(ReplayError::Duplicate(counter));
        }
        Ok(())
    }

    /// Record a counter that passed [ReplayWindow::check] and whose packet was
    /// accepted.
    pub fn mark(&mut self, counter: u64) {
        if counter > self.highest {
            let shift = counter - self.highest;
            self.seen = if shift >= WINDOW { 0 } else { self.seen << shift };
            self.seen |= 1;
            self.highest = counter;
        } else {
            let offset = self.highest - counter;
            if offset < WINDOW {
                self.seen |= 1 << offset;
            }
        }
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn accept(window: &mut ReplayWindow, counter: u64) -> Result<(), ReplayError> {
        window.check(counter)?;
        window.mark(counter);
        Ok(())
    }

    #[test]
    fn in_order_then_repeat() {
        let mut window = ReplayWindow::new();
        for counter in 1..=10 {
            accept(&mut window, counter).unwrap();
        }
        assert_eq!(accept(&mut window, 10), Err(ReplayError::Duplicate(10)));
        assert_eq!(accept(&mut window, 3), Err(ReplayError::Duplicate(3)));
    }

    #[test]
    fn reordering_inside_the_window() {
        let mut window = ReplayWindow::new();
        accept(&mut window, 5).unwrap();
        accept(&mut window, 2).unwrap();
        accept(&mut window, 4).unwrap();
        assert_eq!(accept(&mut window, 2), Err(ReplayError::Duplicate(2)));
        accept(&mut window, 1).unwrap();
    }

    #[test]
    fn too_old_after_a_jump() {
        let mut window = ReplayWindow::new();
        accept(&mut window, 1).unwrap();
        accept(&mut window, 1 + WINDOW).unwrap();
        assert_eq!(
            accept(&mut window, 1),
            Err(ReplayError::TooOld {
                counter: 1,
                highest: 1 + WINDOW
            })
        );
        accept(&mut window, 2).unwrap();
    }

    #[test]
    fn check_does_not_record() {
        let mut window = ReplayWindow::new();
        window.check(7).unwrap();
        window.check(7).unwrap();
        assert_eq!(window.highest(), 0);
        assert_eq!(accept(&mut window, 0), Err(ReplayError::Zero));
    }
}
