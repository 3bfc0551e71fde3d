//! Inbound receive loop
//!
//! Runs as its own task for the lifetime of a session, turning frames into
//! [`InboundMessage`]s and handing them to the presenter in receipt order.
//!
//! Cancellation is soft: once the token fires the loop keeps reading for the
//! grace window, because the service may still be flushing its response
//! after the end of the audio stream.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use super::transport::{Frame, FrameStream};

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Structured text (JSON) from the service
    Text(String),
    /// Opaque binary payload
    Binary(Vec<u8>),
    /// The service closed the connection
    Close { code: u16, reason: String },
}

/// Why the receive loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A close frame arrived
    Closed { code: u16, reason: String },
    /// The stream ended without a close frame
    StreamEnded,
    /// Cancelled and the grace window ran out
    GraceExpired,
    /// Unrecoverable transport error
    TransportFailed(String),
}

/// Receive frames until close, stream end, transport failure, or the grace
/// window after cancellation elapses.
///
/// # Arguments
/// * `stream` - Inbound half of the session's channel
/// * `cancel` - Soft cancellation signal
/// * `grace` - How long to keep reading once cancelled
/// * `dispatch` - Where decoded messages go; a dropped receiver is tolerated
pub async fn receive_loop<R: FrameStream>(
    mut stream: R,
    cancel: CancellationToken,
    grace: Duration,
    dispatch: mpsc::Sender<InboundMessage>,
) -> ReceiveOutcome {
    let mut deadline: Option<Instant> = None;
    let mut received: u64 = 0;
    let mut dispatch_open = true;

    let outcome = loop {
        let next = match deadline {
            None => tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    log::debug!("Receive loop: cancelled, draining for up to {:?}", grace);
                    deadline = Some(Instant::now() + grace);
                    continue;
                }

                next = stream.recv() => next,
            },
            Some(at) => match timeout_at(at, stream.recv()).await {
                Ok(next) => next,
                Err(_) => break ReceiveOutcome::GraceExpired,
            },
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::warn!("Receive loop: transport error: {}", e);
                break ReceiveOutcome::TransportFailed(e.to_string());
            }
            None => {
                log::info!("Receive loop: stream ended");
                break ReceiveOutcome::StreamEnded;
            }
        };
        received += 1;

        let (message, close) = match frame {
            Frame::Text(text) => (InboundMessage::Text(text), None),
            Frame::Binary(data) => {
                log::debug!("Receive loop: unexpected binary frame ({} bytes)", data.len());
                (InboundMessage::Binary(data), None)
            }
            Frame::Close { code, reason } => {
                log::info!("Receive loop: closed by server ({} {:?})", code, reason);
                (
                    InboundMessage::Close {
                        code,
                        reason: reason.clone(),
                    },
                    Some(ReceiveOutcome::Closed { code, reason }),
                )
            }
        };

        if dispatch_open && dispatch.send(message).await.is_err() {
            log::debug!("Receive loop: presenter channel closed");
            dispatch_open = false;
        }

        if let Some(outcome) = close {
            break outcome;
        }
    };

    log::debug!("Receive loop exiting after {} frame(s): {:?}", received, outcome);
    outcome
}
