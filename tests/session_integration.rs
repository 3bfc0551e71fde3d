//! Integration tests for the streaming session
//!
//! These tests drive a full session (setup, audio, end of stream, close)
//! against an in-memory duplex channel and check what the service would see.
//!
//! ## Running Tests
//!
//! ### Mock tests (no API key needed):
//! ```bash
//! cargo test --test session_integration mock_
//! ```
//!
//! ### Live test (requires API key and network):
//! ```bash
//! export GEMINI_API_KEY=your-key
//! cargo test --test session_integration live_ -- --ignored
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tokio::sync::mpsc;

use voice_live::audio::{AudioChunk, AudioFormat};
use voice_live::state_machine::SessionState;
use voice_live::streaming::{
    receive_loop, Frame, FrameSink, FrameStream, InboundMessage, LiveSession, ReceiveOutcome,
    SetupConfig, StreamingError, NORMAL_CLOSURE,
};

/// Outbound half that records frames and can fail chosen sends (1-based)
#[derive(Clone, Default)]
struct MockSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    attempts: Arc<Mutex<usize>>,
    fail_on: Arc<Mutex<Vec<usize>>>,
    disconnect_from: Arc<Mutex<Option<usize>>>,
    closes: Arc<Mutex<usize>>,
}

impl MockSink {
    fn failing_on(attempts: &[usize]) -> Self {
        let sink = Self::default();
        sink.fail_on.lock().unwrap().extend_from_slice(attempts);
        sink
    }

    /// Every send from attempt `n` on finds the channel closed
    fn disconnecting_from(n: usize) -> Self {
        let sink = Self::default();
        *sink.disconnect_from.lock().unwrap() = Some(n);
        sink
    }

    fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }

    /// Text frames parsed as JSON, in send order
    fn messages(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                _ => None,
            })
            .collect()
    }
}

impl FrameSink for MockSink {
    async fn send(&mut self, frame: Frame) -> Result<(), StreamingError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            *attempts
        };
        if self
            .disconnect_from
            .lock()
            .unwrap()
            .map_or(false, |from| attempt >= from)
        {
            return Err(StreamingError::Disconnected("connection reset".to_string()));
        }
        if self.fail_on.lock().unwrap().contains(&attempt) {
            return Err(StreamingError::TransportError("write failed".to_string()));
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

/// Inbound half fed by the test playing the server
struct MockStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl FrameStream for MockStream {
    async fn recv(&mut self) -> Option<Result<Frame, StreamingError>> {
        self.rx.recv().await.map(Ok)
    }
}

fn server_channel() -> (mpsc::UnboundedSender<Frame>, MockStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, MockStream { rx })
}

fn setup_config() -> SetupConfig {
    SetupConfig::new(
        "models/gemini-2.0-flash-live-001",
        &["TEXT".to_string()],
        "Answer briefly.",
    )
}

fn chunk(sequence: u64) -> AudioChunk {
    let samples: Vec<i16> = (0..160).map(|i| (i as i16) * (sequence as i16 + 1)).collect();
    AudioChunk::from_samples(&samples, AudioFormat::pcm16_mono(16000), sequence)
}

async fn queue(chunks: &[AudioChunk]) -> mpsc::Receiver<AudioChunk> {
    let (tx, rx) = mpsc::channel(chunks.len().max(1));
    for c in chunks {
        tx.send(c.clone()).await.unwrap();
    }
    rx
}

// ============================================================================
// Mock Tests - No API key or network required
// ============================================================================

mod mock_tests {
    use super::*;

    #[tokio::test]
    async fn mock_full_session_sends_messages_in_order() {
        let sink = MockSink::default();
        let session = LiveSession::new(sink.clone());
        let chunks: Vec<_> = (0..3).map(chunk).collect();

        session.send_setup(&setup_config()).await.unwrap();
        let mut rx = queue(&chunks).await;
        let stats = session.stream_audio(&mut rx).await.unwrap();
        session.signal_end().await.unwrap();
        session.close("client finished").await;

        assert_eq!(stats.chunks_sent, 3);
        assert_eq!(session.state(), SessionState::Closed);

        let messages = sink.messages();
        assert_eq!(messages.len(), 5);
        assert!(messages[0].get("setup").is_some());
        for message in &messages[1..4] {
            assert!(message["realtimeInput"].get("audio").is_some());
        }
        assert_eq!(messages[4]["realtimeInput"]["audioStreamEnd"], true);

        // Exactly one close, after everything else
        assert_eq!(sink.closes(), 1);
        assert_eq!(
            sink.frames().last(),
            Some(&Frame::Close {
                code: NORMAL_CLOSURE,
                reason: "client finished".to_string()
            })
        );
    }

    #[tokio::test]
    async fn mock_audio_payload_round_trips() {
        let sink = MockSink::default();
        let session = LiveSession::new(sink.clone());
        let chunks: Vec<_> = (0..4).map(chunk).collect();

        session.send_setup(&setup_config()).await.unwrap();
        let mut rx = queue(&chunks).await;
        session.stream_audio(&mut rx).await.unwrap();

        let audio: Vec<Value> = sink.messages()[1..].to_vec();
        assert_eq!(audio.len(), chunks.len());
        for (message, original) in audio.iter().zip(&chunks) {
            let blob = &message["realtimeInput"]["audio"];
            assert_eq!(blob["mimeType"], "audio/pcm;rate=16000");
            let decoded = STANDARD.decode(blob["data"].as_str().unwrap()).unwrap();
            assert_eq!(decoded, original.data);
        }
    }

    #[tokio::test]
    async fn mock_setup_payload_carries_model_and_instruction() {
        let sink = MockSink::default();
        let session = LiveSession::new(sink.clone());
        session.send_setup(&setup_config()).await.unwrap();

        let setup = &sink.messages()[0]["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "TEXT");
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Answer briefly.");
    }

    #[tokio::test]
    async fn mock_double_close_sends_one_close_frame() {
        let sink = MockSink::default();
        let session = LiveSession::new(sink.clone());
        session.send_setup(&setup_config()).await.unwrap();
        session.signal_end().await.unwrap();

        session.close("first").await;
        session.close("second").await;

        assert_eq!(sink.closes(), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn mock_failed_chunk_does_not_stop_stream() {
        // Attempt #1 is setup, so #4 is the third audio chunk
        let sink = MockSink::failing_on(&[4]);
        let session = LiveSession::new(sink.clone());
        let chunks: Vec<_> = (0..4).map(chunk).collect();

        session.send_setup(&setup_config()).await.unwrap();
        let mut rx = queue(&chunks).await;
        let stats = session.stream_audio(&mut rx).await.unwrap();

        assert_eq!(stats.chunks_failed, 1);
        assert_eq!(stats.chunks_sent, 3);
        // The fourth chunk was still attempted
        assert_eq!(sink.attempts(), 5);

        // Remaining chunks keep their relative order
        let sent: Vec<Vec<u8>> = sink.messages()[1..]
            .iter()
            .map(|m| {
                STANDARD
                    .decode(m["realtimeInput"]["audio"]["data"].as_str().unwrap())
                    .unwrap()
            })
            .collect();
        assert_eq!(
            sent,
            vec![
                chunks[0].data.clone(),
                chunks[1].data.clone(),
                chunks[3].data.clone()
            ]
        );
    }

    #[tokio::test]
    async fn mock_closed_channel_stops_stream_immediately() {
        // Attempt #1 is setup; the channel is gone from the second chunk on
        let sink = MockSink::disconnecting_from(3);
        let session = LiveSession::new(sink.clone());
        let chunks: Vec<_> = (0..5).map(chunk).collect();

        session.send_setup(&setup_config()).await.unwrap();
        let mut rx = queue(&chunks).await;
        let result = session.stream_audio(&mut rx).await;

        assert!(matches!(result, Err(StreamingError::Disconnected(_))));
        assert_eq!(sink.attempts(), 3);
        // Only the first chunk made it out
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test]
    async fn mock_no_close_frame_after_server_close() {
        let sink = MockSink::default();
        let session = LiveSession::new(sink.clone());
        let (server, stream) = server_channel();
        let (tx, _rx) = mpsc::channel(8);

        session.send_setup(&setup_config()).await.unwrap();
        server
            .send(Frame::Close {
                code: 1000,
                reason: "bye".into(),
            })
            .unwrap();

        let outcome =
            receive_loop(stream, session.cancellation(), Duration::from_secs(3), tx).await;
        assert!(matches!(outcome, ReceiveOutcome::Closed { .. }));

        session.mark_peer_closed();
        session.close("client finished").await;

        assert_eq!(sink.closes(), 0);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn mock_missing_api_key_is_rejected_before_connecting() {
        let result = LiveSession::<voice_live::streaming::WsSink>::connect(
            voice_live::streaming::DEFAULT_ENDPOINT,
            "",
        )
        .await;
        assert!(matches!(result, Err(StreamingError::MissingApiKey)));
    }

    #[tokio::test]
    async fn mock_server_close_ends_receive_loop() {
        let (server, stream) = server_channel();
        let (tx, mut rx) = mpsc::channel(16);
        let session = LiveSession::new(MockSink::default());

        let receiver = tokio::spawn(receive_loop(
            stream,
            session.cancellation(),
            Duration::from_secs(3),
            tx,
        ));

        server.send(Frame::Text(r#"{"setupComplete":{}}"#.into())).unwrap();
        server
            .send(Frame::Close {
                code: 1011,
                reason: "internal".into(),
            })
            .unwrap();

        let outcome = receiver.await.unwrap();
        assert_eq!(
            outcome,
            ReceiveOutcome::Closed {
                code: 1011,
                reason: "internal".into()
            }
        );
        assert!(matches!(rx.recv().await, Some(InboundMessage::Text(_))));
        assert!(matches!(rx.recv().await, Some(InboundMessage::Close { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mock_concurrent_send_and_receive_keep_order() {
        const SENT: u64 = 50;
        const RECEIVED: usize = 40;

        let sink = MockSink::default();
        let session = Arc::new(LiveSession::new(sink.clone()));
        let (server, stream) = server_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);

        let receiver = tokio::spawn(receive_loop(
            stream,
            session.cancellation(),
            Duration::from_secs(3),
            inbound_tx,
        ));

        session.send_setup(&setup_config()).await.unwrap();

        let (chunk_tx, mut chunk_rx) = mpsc::channel(4);
        let sender = {
            let session = session.clone();
            tokio::spawn(async move { session.stream_audio(&mut chunk_rx).await })
        };
        let producer = tokio::spawn(async move {
            for seq in 0..SENT {
                chunk_tx.send(chunk(seq)).await.unwrap();
            }
        });
        let server_task = tokio::spawn(async move {
            for i in 0..RECEIVED {
                server.send(Frame::Text(format!(r#"{{"n":{}}}"#, i))).unwrap();
                tokio::task::yield_now().await;
            }
            server
                .send(Frame::Close {
                    code: NORMAL_CLOSURE,
                    reason: String::new(),
                })
                .unwrap();
        });

        let mut inbound = Vec::new();
        while let Some(message) = inbound_rx.recv().await {
            inbound.push(message);
        }

        producer.await.unwrap();
        server_task.await.unwrap();
        let stats = sender.await.unwrap().unwrap();
        assert!(matches!(receiver.await.unwrap(), ReceiveOutcome::Closed { .. }));

        // Receipt order preserved
        let texts: Vec<String> = inbound
            .iter()
            .filter_map(|m| match m {
                InboundMessage::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..RECEIVED).map(|i| format!(r#"{{"n":{}}}"#, i)).collect();
        assert_eq!(texts, expected);

        // Send order preserved, nothing interleaved with setup
        assert_eq!(stats.chunks_sent, SENT);
        let sent: Vec<Vec<u8>> = sink.messages()[1..]
            .iter()
            .map(|m| {
                STANDARD
                    .decode(m["realtimeInput"]["audio"]["data"].as_str().unwrap())
                    .unwrap()
            })
            .collect();
        let expected: Vec<Vec<u8>> = (0..SENT).map(|seq| chunk(seq).data).collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_cancel_after_stream_end_exits_within_grace_window() {
        let grace = Duration::from_secs(3);
        let sink = MockSink::default();
        let session = LiveSession::new(sink.clone());
        // The server never closes; only the grace window can end the loop
        let (_server, stream) = server_channel();
        let (tx, _rx) = mpsc::channel(8);

        let receiver = tokio::spawn(receive_loop(stream, session.cancellation(), grace, tx));

        session.send_setup(&setup_config()).await.unwrap();
        session.signal_end().await.unwrap();

        let started = tokio::time::Instant::now();
        session.cancel();
        let outcome = receiver.await.unwrap();
        session.close("client finished").await;

        assert_eq!(outcome, ReceiveOutcome::GraceExpired);
        assert!(started.elapsed() <= grace + Duration::from_millis(100));
        assert_eq!(sink.closes(), 1);
    }

    #[tokio::test]
    async fn mock_trailing_response_arrives_during_grace_window() {
        let session = LiveSession::new(MockSink::default());
        let (server, stream) = server_channel();
        let (tx, mut rx) = mpsc::channel(8);

        session.cancel();
        server.send(Frame::Text("late".into())).unwrap();
        drop(server);

        let outcome =
            receive_loop(stream, session.cancellation(), Duration::from_secs(3), tx).await;

        assert_eq!(outcome, ReceiveOutcome::StreamEnded);
        assert_eq!(rx.recv().await, Some(InboundMessage::Text("late".into())));
    }
}

// ============================================================================
// Live Tests - Require GEMINI_API_KEY and network access
// ============================================================================

mod live_tests {
    use super::*;
    use voice_live::streaming::{WsSink, DEFAULT_ENDPOINT};

    #[tokio::test]
    #[ignore]
    async fn live_setup_is_acknowledged() {
        let Ok(api_key) = std::env::var("GEMINI_API_KEY") else {
            eprintln!("Skipping: GEMINI_API_KEY not set");
            return;
        };

        let (session, stream) = LiveSession::<WsSink>::connect(DEFAULT_ENDPOINT, &api_key)
            .await
            .expect("connect");
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = tokio::spawn(receive_loop(
            stream,
            session.cancellation(),
            Duration::from_secs(5),
            tx,
        ));

        session.send_setup(&setup_config()).await.expect("setup");

        let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no response within 10s")
            .expect("receive loop ended");
        let payload = match first {
            InboundMessage::Text(text) => text.into_bytes(),
            InboundMessage::Binary(data) => data,
            other => panic!("unexpected first message: {:?}", other),
        };
        let message: Value = serde_json::from_slice(&payload).expect("json");
        assert!(message.get("setupComplete").is_some());

        session.signal_end().await.expect("stream end");
        session.cancel();
        session.close("test finished").await;
        let _ = receiver.await;
    }
}
