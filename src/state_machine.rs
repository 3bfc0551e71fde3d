//! Session lifecycle state machine
//!
//! A session only ever moves forward:
//!
//! ```text
//! Idle -> Connected -> SetupSent -> Streaming -> StreamEnded -> Closing -> Closed
//! ```
//!
//! All transitions go through [`SessionState::on`], which returns the next
//! state or `None` when the event is not valid in the current state.

/// Lifecycle state of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connected,
    SetupSent,
    Streaming,
    StreamEnded,
    Closing,
    Closed,
}

/// Events that drive the session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The duplex channel is open
    Connect,
    /// The setup message is about to be sent
    SendSetup,
    /// An audio chunk is about to be sent (repeats while streaming)
    SendAudio,
    /// The end-of-stream marker is about to be sent
    SignalEnd,
    /// Teardown started
    BeginClose,
    /// The channel has been released
    FinishClose,
}

impl SessionState {
    /// Transition function: (state, event) -> next state
    ///
    /// Key rules:
    /// - Setup is only valid right after connecting
    /// - Audio only flows between setup and end-of-stream
    /// - End-of-stream is accepted once
    /// - Close may start from any open state (abort path)
    pub fn on(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Idle, Connect) => Some(Connected),
            (Connected, SendSetup) => Some(SetupSent),
            (SetupSent | Streaming, SendAudio) => Some(Streaming),
            (SetupSent | Streaming, SignalEnd) => Some(StreamEnded),
            (Closing | Closed, BeginClose) => None,
            (_, BeginClose) => Some(Closing),
            (Closing, FinishClose) => Some(Closed),
            _ => None,
        }
    }

    /// Whether close still has work to do
    pub fn is_open(self) -> bool {
        !matches!(self, SessionState::Closing | SessionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::SetupSent => "setup-sent",
            SessionState::Streaming => "streaming",
            SessionState::StreamEnded => "stream-ended",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}
