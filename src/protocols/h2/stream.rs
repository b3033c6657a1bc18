//! Per-stream state.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::http::FieldSection;

use super::flow::{RecvWindow, SendWindow};

/// RFC 9113 §5.1 stream states, reserved states omitted because push
/// is never enabled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl State {
    /// Applies "local side finished" (END_STREAM sent).
    #[must_use]
    pub fn close_local(self) -> State {
        match self {
            State::Open => State::HalfClosedLocal,
            State::HalfClosedRemote | State::Closed => State::Closed,
            State::HalfClosedLocal => State::HalfClosedLocal,
        }
    }

    /// Applies "remote side finished" (END_STREAM received).
    #[must_use]
    pub fn close_remote(self) -> State {
        match self {
            State::Open => State::HalfClosedRemote,
            State::HalfClosedLocal | State::Closed => State::Closed,
            State::HalfClosedRemote => State::HalfClosedRemote,
        }
    }

    #[inline]
    #[must_use]
    pub fn can_recv(self) -> bool {
        matches!(self, State::Open | State::HalfClosedLocal)
    }

    #[inline]
    #[must_use]
    pub fn can_send(self) -> bool {
        matches!(self, State::Open | State::HalfClosedRemote)
    }

    /// Counts against `SETTINGS_MAX_CONCURRENT_STREAMS`.
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, State::Closed)
    }
}

/// One stream's book-keeping inside the connection's stream table.
#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub state: State,
    pub send_window: SendWindow,
    pub recv_window: RecvWindow,
    /// Body bytes queued for sending, drained by the scheduler.
    pub outbound: VecDeque<(Bytes, bool)>,
    /// Set once END_STREAM has been queued for sending.
    pub end_queued: bool,
    /// Trailers queued to follow the final DATA. Encoded only at
    /// emission time so HPACK blocks hit the wire in encode order.
    pub trailers: Option<FieldSection>,
    /// True once the peer's (final) message head arrived.
    pub head_received: bool,
    /// True once our (final) message head went out; a second final
    /// response on the same stream is refused.
    pub head_sent: bool,
}

impl Stream {
    #[must_use]
    pub fn new(id: u32, send_initial: u32, recv_initial: u32) -> Self {
        Stream {
            id,
            state: State::Open,
            send_window: SendWindow::new(send_initial),
            recv_window: RecvWindow::new(recv_initial),
            outbound: VecDeque::new(),
            end_queued: false,
            trailers: None,
            head_received: false,
            head_sent: false,
        }
    }

    /// Bytes waiting to be sent.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.outbound.iter().map(|(b, _)| b.len()).sum()
    }

    /// True when the scheduler still owes this stream wire output.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty() || self.trailers.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_closing_reaches_closed() {
        let state = State::Open;
        let state = state.close_local();
        assert_eq!(state, State::HalfClosedLocal);
        assert!(state.can_recv());
        assert!(!state.can_send());
        assert_eq!(state.close_remote(), State::Closed);

        let state = State::Open.close_remote().close_local();
        assert_eq!(state, State::Closed);
    }
}
