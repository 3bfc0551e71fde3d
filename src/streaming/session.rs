//! Gemini Live session manager
//!
//! Owns the outbound half of one duplex conversation and enforces the
//! message order the service expects.
//!
//! # Session Flow
//!
//! 1. `connect()` - Open the WebSocket (no messages sent yet)
//! 2. `send_setup()` - Model, modalities, system instruction (first message)
//! 3. `stream_audio()` - One frame per captured chunk, concurrent with the receive loop
//! 4. `signal_end()` - `audioStreamEnd`, exactly once
//! 5. `close()` - Normal-closure frame, idempotent
//!
//! Sends are serialized through a mutex around the sink. The lifecycle state is
//! checked and advanced while that mutex is held, so the captured send order
//! always matches the state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{OutboundMessage, SetupConfig};
use super::transport::{
    endpoint_url, open_websocket, FrameSink, WsSink, WsStream, NORMAL_CLOSURE,
};
use super::StreamingError;
use crate::audio::AudioChunk;
use crate::state_machine::{SessionEvent, SessionState};

/// Outbound counters returned by [`LiveSession::stream_audio`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Chunks sent successfully
    pub chunks_sent: u64,
    /// Chunks whose send failed (logged and skipped)
    pub chunks_failed: u64,
    /// Raw PCM bytes sent (before base64)
    pub bytes_sent: u64,
    /// Audio duration sent, in milliseconds
    pub audio_ms_sent: u64,
}

/// Handle to one streaming conversation
///
/// Share it behind an `Arc` between the audio sender task and the driver.
pub struct LiveSession<S: FrameSink> {
    id: Uuid,
    /// `None` once the session has been closed
    sink: tokio::sync::Mutex<Option<S>>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    /// Set once the service has closed its side
    peer_closed: AtomicBool,
}

impl LiveSession<WsSink> {
    /// Connect to the Gemini Live API
    ///
    /// # Arguments
    /// * `endpoint` - `wss://` endpoint without the key
    /// * `api_key` - Gemini API key (must be non-empty)
    ///
    /// # Returns
    /// The session and the inbound half, which belongs to [`super::receive_loop`]
    pub async fn connect(
        endpoint: &str,
        api_key: &str,
    ) -> Result<(Self, WsStream), StreamingError> {
        let url = endpoint_url(endpoint, api_key)?;
        let (sink, stream) = open_websocket(&url).await?;
        Ok((Self::new(sink), stream))
    }
}

impl<S: FrameSink> LiveSession<S> {
    /// Wrap an already-open sink; the session starts out `Connected`
    pub fn new(sink: S) -> Self {
        let state = SessionState::Idle
            .on(SessionEvent::Connect)
            .unwrap_or(SessionState::Connected);
        let id = Uuid::new_v4();
        log::info!("Session {}: connected", id);

        Self {
            id,
            sink: tokio::sync::Mutex::new(Some(sink)),
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
            peer_closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Token observed by the sender and (usually) the receive loop
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop issuing sends; the receive loop enters its grace window
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Record that the service closed the channel, so `close` has no frame to send
    pub fn mark_peer_closed(&self) {
        if !self.peer_closed.swap(true, Ordering::SeqCst) {
            log::debug!("Session {}: peer closed the channel", self.id);
        }
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        // A panic elsewhere must not wedge teardown
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, event: SessionEvent) -> Result<SessionState, StreamingError> {
        let mut state = self.lock_state();
        match state.on(event) {
            Some(next) => {
                if next != *state {
                    log::debug!(
                        "Session {}: {} -> {}",
                        self.id,
                        state.as_str(),
                        next.as_str()
                    );
                }
                *state = next;
                Ok(next)
            }
            None => Err(StreamingError::ProtocolError(format!(
                "{:?} is not allowed while {}",
                event,
                state.as_str()
            ))),
        }
    }

    /// Check the transition and send the frame as one step
    async fn send_guarded(
        &self,
        event: SessionEvent,
        message: &OutboundMessage,
    ) -> Result<(), StreamingError> {
        let frame = message.to_frame()?;

        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| StreamingError::Disconnected("session closed".to_string()))?;

        // Checked under the lock: nothing goes out once cancellation fired
        if self.cancel.is_cancelled() {
            return Err(StreamingError::Cancelled);
        }

        self.advance(event)?;
        log::trace!("Session {}: sending {}", self.id, message.kind());
        sink.send(frame).await
    }

    /// Send the setup message. Must be the first message on the session.
    pub async fn send_setup(&self, config: &SetupConfig) -> Result<(), StreamingError> {
        log::info!(
            "Session {}: sending setup (model {}, modalities {:?})",
            self.id,
            config.model,
            config.generation_config.response_modalities
        );

        let message = OutboundMessage::Setup(config.clone());
        self.send_guarded(SessionEvent::SendSetup, &message)
            .await
            .map_err(|e| match e {
                StreamingError::ProtocolError(_) | StreamingError::Cancelled => e,
                other => StreamingError::ProtocolError(format!("setup not delivered: {}", other)),
            })
    }

    /// Stream audio until the source ends or the session is cancelled
    ///
    /// Chunks go out in the order they were produced, one frame each. A failed
    /// send is logged and skipped; a closed channel stops streaming.
    ///
    /// Returns the outbound counters.
    pub async fn stream_audio(
        &self,
        source: &mut mpsc::Receiver<AudioChunk>,
    ) -> Result<StreamStats, StreamingError> {
        let state = self.state();
        if !matches!(state, SessionState::SetupSent | SessionState::Streaming) {
            return Err(StreamingError::ProtocolError(format!(
                "cannot stream audio while {}",
                state.as_str()
            )));
        }

        log::info!("Session {}: starting audio stream", self.id);
        let mut stats = StreamStats::default();

        loop {
            let chunk = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    log::info!("Session {}: audio stream cancelled", self.id);
                    break;
                }

                chunk = source.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let sequence = chunk.sequence;
            let len = chunk.len() as u64;
            let duration_ms = chunk.duration_ms();

            match self
                .send_guarded(SessionEvent::SendAudio, &OutboundMessage::Audio(chunk))
                .await
            {
                Ok(()) => {
                    stats.chunks_sent += 1;
                    stats.bytes_sent += len;
                    stats.audio_ms_sent += duration_ms;

                    // Periodic logging (every 50 chunks = ~5 seconds)
                    if stats.chunks_sent % 50 == 0 {
                        log::debug!("Session {}: sent {} chunks", self.id, stats.chunks_sent);
                    }
                }
                Err(e) if e.is_disconnect() => {
                    log::warn!(
                        "Session {}: channel closed while streaming (chunk {}): {}",
                        self.id,
                        sequence,
                        e
                    );
                    return Err(e);
                }
                Err(StreamingError::Cancelled) => {
                    log::info!("Session {}: audio stream cancelled", self.id);
                    break;
                }
                Err(StreamingError::ProtocolError(msg)) => {
                    // Stream already ended or session closing: nothing more may be sent
                    log::warn!("Session {}: audio stream stopped: {}", self.id, msg);
                    break;
                }
                Err(e) => {
                    stats.chunks_failed += 1;
                    log::warn!(
                        "Session {}: failed to send audio chunk {}: {}",
                        self.id,
                        sequence,
                        e
                    );
                }
            }
        }

        log::info!(
            "Session {}: audio stream complete, {} chunks sent, {} failed",
            self.id,
            stats.chunks_sent,
            stats.chunks_failed
        );
        Ok(stats)
    }

    /// Mark the end of the audio stream. Accepted exactly once.
    pub async fn signal_end(&self) -> Result<(), StreamingError> {
        log::info!("Session {}: signalling end of audio stream", self.id);
        self.send_guarded(SessionEvent::SignalEnd, &OutboundMessage::StreamEnd)
            .await
            .map_err(|e| match e {
                StreamingError::ProtocolError(_) | StreamingError::Cancelled => e,
                other => {
                    StreamingError::ProtocolError(format!("stream end not delivered: {}", other))
                }
            })
    }

    /// Send a normal-closure frame and release the channel
    ///
    /// Idempotent: only the first call sends anything.
    pub async fn close(&self, reason: &str) {
        let state = self.state();
        if !state.is_open() {
            log::debug!("Session {}: close ignored, already {}", self.id, state.as_str());
            return;
        }
        if let Err(e) = self.advance(SessionEvent::BeginClose) {
            log::debug!("Session {}: close ignored ({})", self.id, e);
            return;
        }

        // Stop the sender before taking the sink
        self.cancel.cancel();

        let sink = self.sink.lock().await.take();
        match sink {
            Some(_) if self.peer_closed() => {
                log::info!("Session {}: closed by peer, releasing channel", self.id);
            }
            Some(mut sink) => {
                log::info!("Session {}: closing ({})", self.id, reason);
                if let Err(e) = sink.close(NORMAL_CLOSURE, reason).await {
                    log::warn!("Session {}: error sending close frame: {}", self.id, e);
                }
            }
            None => {}
        }

        if let Err(e) = self.advance(SessionEvent::FinishClose) {
            log::warn!("Session {}: {}", self.id, e);
        }
    }
}

impl<S: FrameSink> Drop for LiveSession<S> {
    fn drop(&mut self) {
        // Release anything still waiting on the session
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::streaming::Frame;
    use std::sync::Arc;

    /// Records every frame; optionally fails chosen sends
    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Frame>>>,
        fail_sends: Arc<Mutex<Vec<usize>>>,
        /// Every send from this attempt on finds the channel closed
        disconnect_from: Arc<Mutex<Option<usize>>>,
        sends: Arc<Mutex<usize>>,
        closes: Arc<Mutex<usize>>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FrameSink for RecordingSink {
        async fn send(&mut self, frame: Frame) -> Result<(), StreamingError> {
            let n = {
                let mut sends = self.sends.lock().unwrap();
                *sends += 1;
                *sends
            };
            if self.disconnect_from.lock().unwrap().map_or(false, |from| n >= from) {
                return Err(StreamingError::Disconnected("closed".to_string()));
            }
            if self.fail_sends.lock().unwrap().contains(&n) {
                return Err(StreamingError::TransportError("injected".to_string()));
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self, code: u16, reason: &str) -> Result<(), StreamingError> {
            *self.closes.lock().unwrap() += 1;
            self.frames.lock().unwrap().push(Frame::Close {
                code,
                reason: reason.to_string(),
            });
            Ok(())
        }
    }

    fn setup() -> SetupConfig {
        SetupConfig::new("models/test", &["TEXT".to_string()], "be brief")
    }

    fn chunk(seq: u64) -> AudioChunk {
        AudioChunk::from_samples(&[seq as i16; 8], AudioFormat::pcm16_mono(16000), seq)
    }

    #[test]
    fn test_new_session_is_connected() {
        let session = LiveSession::new(RecordingSink::default());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_setup_twice_is_rejected_without_sending() {
        let sink = RecordingSink::default();
        let session = LiveSession::new(sink.clone());

        session.send_setup(&setup()).await.unwrap();
        let err = session.send_setup(&setup()).await.unwrap_err();

        assert!(matches!(err, StreamingError::ProtocolError(_)));
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_audio_before_setup_is_rejected() {
        let sink = RecordingSink::default();
        let session = LiveSession::new(sink.clone());
        let (_tx, mut rx) = mpsc::channel(4);

        let err = session.stream_audio(&mut rx).await.unwrap_err();
        assert!(matches!(err, StreamingError::ProtocolError(_)));
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn test_stream_end_twice_is_rejected() {
        let sink = RecordingSink::default();
        let session = LiveSession::new(sink.clone());

        session.send_setup(&setup()).await.unwrap();
        session.signal_end().await.unwrap();
        assert!(session.signal_end().await.is_err());
        assert_eq!(sink.frames().len(), 2);
        assert_eq!(session.state(), SessionState::StreamEnded);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sink = RecordingSink::default();
        let session = LiveSession::new(sink.clone());

        session.close("done").await;
        session.close("again").await;

        let closes: Vec<_> = sink
            .frames()
            .into_iter()
            .filter(|f| matches!(f, Frame::Close { .. }))
            .collect();
        assert_eq!(
            closes,
            vec![Frame::Close {
                code: NORMAL_CLOSURE,
                reason: "done".to_string()
            }]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let session = LiveSession::new(RecordingSink::default());
        session.close("bye").await;

        assert!(session.send_setup(&setup()).await.is_err());
        assert!(session.signal_end().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_chunk_is_skipped() {
        let sink = RecordingSink::default();
        // Send #1 is setup, #2..#5 are chunks 0..3; fail chunk 2
        sink.fail_sends.lock().unwrap().push(4);
        let session = LiveSession::new(sink.clone());
        session.send_setup(&setup()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        for seq in 0..4 {
            tx.send(chunk(seq)).await.unwrap();
        }
        drop(tx);

        let stats = session.stream_audio(&mut rx).await.unwrap();
        assert_eq!(stats.chunks_sent, 3);
        assert_eq!(stats.chunks_failed, 1);
        assert_eq!(stats.bytes_sent, 3 * 16);
        // 8 samples at 16 kHz round down to 0 ms
        assert_eq!(stats.audio_ms_sent, 0);
        assert_eq!(*sink.sends.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cancel_stops_streaming() {
        let session = LiveSession::new(RecordingSink::default());
        session.send_setup(&setup()).await.unwrap();
        session.cancel();

        // The sender is still alive, so only cancellation can end the loop
        let (_tx, mut rx) = mpsc::channel::<AudioChunk>(1);
        let stats = session.stream_audio(&mut rx).await.unwrap();
        assert_eq!(stats, StreamStats::default());
    }

    #[tokio::test]
    async fn test_closed_channel_stops_streaming() {
        let sink = RecordingSink::default();
        // Send #1 is setup; the channel closes at chunk 1 (send #3)
        *sink.disconnect_from.lock().unwrap() = Some(3);
        let session = LiveSession::new(sink.clone());
        session.send_setup(&setup()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        for seq in 0..5 {
            tx.send(chunk(seq)).await.unwrap();
        }
        drop(tx);

        let err = session.stream_audio(&mut rx).await.unwrap_err();
        assert!(err.is_disconnect());
        // No chunk after the closed one was attempted
        assert_eq!(*sink.sends.lock().unwrap(), 3);
        assert_eq!(rx.recv().await.map(|c| c.sequence), Some(2));
    }

    #[tokio::test]
    async fn test_sends_refused_once_cancelled() {
        let sink = RecordingSink::default();
        let session = LiveSession::new(sink.clone());
        session.cancel();

        assert_eq!(
            session.send_setup(&setup()).await,
            Err(StreamingError::Cancelled)
        );
        assert!(sink.frames().is_empty());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_stream_end_after_cancel_is_not_sent() {
        let sink = RecordingSink::default();
        let session = LiveSession::new(sink.clone());
        session.send_setup(&setup()).await.unwrap();
        session.cancel();

        assert_eq!(session.signal_end().await, Err(StreamingError::Cancelled));
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(session.state(), SessionState::SetupSent);
    }

    #[tokio::test]
    async fn test_close_after_peer_close_sends_nothing() {
        let sink = RecordingSink::default();
        let session = LiveSession::new(sink.clone());
        session.send_setup(&setup()).await.unwrap();

        session.mark_peer_closed();
        session.close("client finished").await;

        assert!(session.peer_closed());
        assert_eq!(*sink.closes.lock().unwrap(), 0);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.send_setup(&setup()).await.is_err());
    }

    #[tokio::test]
    async fn test_audio_duration_is_counted() {
        let session = LiveSession::new(RecordingSink::default());
        session.send_setup(&setup()).await.unwrap();

        let format = AudioFormat::pcm16_mono(16000);
        let (tx, mut rx) = mpsc::channel(4);
        for seq in 0..3 {
            tx.send(AudioChunk::from_samples(&[0; 1600], format, seq))
                .await
                .unwrap();
        }
        drop(tx);

        let stats = session.stream_audio(&mut rx).await.unwrap();
        assert_eq!(stats.audio_ms_sent, 300);
    }
}
