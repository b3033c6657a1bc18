//! Flow-control windows.
//!
//! Send windows may go negative when the peer shrinks
//! `SETTINGS_INITIAL_WINDOW_SIZE` under in-flight data; they must never
//! exceed 2^31-1. Receive windows track how much credit has been
//! consumed and decide when a WINDOW_UPDATE is due.

use super::frame::ErrorCode;

const MAX_WINDOW: i64 = 0x7fff_ffff;

/// Credit available for sending DATA.
#[derive(Debug, Clone, Copy)]
pub struct SendWindow(i64);

impl SendWindow {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        SendWindow(i64::from(initial))
    }

    /// Bytes that may be sent right now.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.0.clamp(0, MAX_WINDOW) as u32
    }

    /// Consumes credit for sent DATA. Callers must stay within
    /// [`SendWindow::available`].
    pub fn consume(&mut self, n: u32) {
        debug_assert!(i64::from(n) <= self.0);
        self.0 -= i64::from(n);
    }

    /// Applies a WINDOW_UPDATE or an INITIAL_WINDOW_SIZE delta.
    pub fn widen(&mut self, delta: i64) -> Result<(), (ErrorCode, String)> {
        let next = self.0 + delta;
        if next > MAX_WINDOW {
            return Err((ErrorCode::FlowControlError, "send window above 2^31-1".into()));
        }
        self.0 = next;
        Ok(())
    }
}

/// Credit granted to the peer for receiving DATA.
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    /// Credit the peer still holds.
    available: i64,
    /// Bytes consumed but not yet returned via WINDOW_UPDATE.
    unreturned: u32,
    /// Target window size; replenishment triggers at half.
    target: u32,
}

impl RecvWindow {
    #[must_use]
    pub fn new(target: u32) -> Self {
        RecvWindow {
            available: i64::from(target),
            unreturned: 0,
            target,
        }
    }

    /// Accounts an incoming DATA frame (padded length). Fails when the
    /// peer overruns its credit.
    pub fn receive(&mut self, n: u32) -> Result<(), (ErrorCode, String)> {
        self.available -= i64::from(n);
        if self.available < 0 {
            return Err((ErrorCode::FlowControlError, "peer overran receive window".into()));
        }
        self.unreturned = self.unreturned.saturating_add(n);
        Ok(())
    }

    /// Returns the WINDOW_UPDATE increment to send, if the unreturned
    /// share crossed half the target window.
    #[must_use]
    pub fn replenish(&mut self) -> Option<u32> {
        if self.unreturned == 0 || u64::from(self.unreturned) * 2 < u64::from(self.target) {
            return None;
        }
        let increment = self.unreturned;
        self.unreturned = 0;
        self.available += i64::from(increment);
        Some(increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_respects_upper_bound() {
        let mut window = SendWindow::new(65_535);
        window.consume(1_000);
        assert_eq!(window.available(), 64_535);
        window.widen(1_000).unwrap();
        assert_eq!(window.available(), 65_535);
        assert!(window.widen(MAX_WINDOW).is_err());
    }

    #[test]
    fn send_window_survives_negative_excursion() {
        let mut window = SendWindow::new(10);
        window.consume(10);
        // Peer shrinks INITIAL_WINDOW_SIZE by more than remains.
        window.widen(-5).unwrap();
        assert_eq!(window.available(), 0);
        window.widen(6).unwrap();
        assert_eq!(window.available(), 1);
    }

    #[test]
    fn recv_window_replenishes_at_half() {
        let mut window = RecvWindow::new(100);
        window.receive(49).unwrap();
        assert_eq!(window.replenish(), None);
        window.receive(1).unwrap();
        assert_eq!(window.replenish(), Some(50));
        assert_eq!(window.replenish(), None);
    }

    #[test]
    fn recv_overrun_is_flow_control_error() {
        let mut window = RecvWindow::new(10);
        assert!(window.receive(11).is_err());
    }
}
