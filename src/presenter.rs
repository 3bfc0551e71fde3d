//! Console presenter for inbound messages
//!
//! Extracts the interesting fields from server messages and prints them as
//! they arrive: model text incrementally, a line break when the turn
//! completes, and the user's own words when input transcription is on.
//!
//! # Aggregation Strategy
//!
//! - **Text parts**: Appended as they arrive and printed immediately
//! - **turnComplete**: Ends the line and starts a fresh turn
//! - **interrupted**: Marks the cut-off turn and ends the line

use std::io::{self, Write};

use tokio::sync::mpsc;

use crate::streaming::{InboundMessage, ServerMessage};

/// Aggregates text parts of the current model turn
#[derive(Debug, Clone, Default)]
pub struct TurnAggregator {
    /// Text of the turn in progress
    current: String,
    /// Count of text parts processed in this turn
    part_count: u64,
    /// Completed turns so far
    turns_completed: u64,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text part to the current turn. Returns the turn so far.
    pub fn push_text(&mut self, text: &str) -> &str {
        if !text.is_empty() {
            self.current.push_str(text);
            self.part_count += 1;

            if self.part_count % 10 == 0 {
                log::debug!(
                    "TurnAggregator: {} parts, {} chars accumulated",
                    self.part_count,
                    self.current.len()
                );
            }
        }
        &self.current
    }

    /// Finish the current turn and return its full text
    pub fn complete_turn(&mut self) -> String {
        log::debug!(
            "TurnAggregator: turn complete with {} chars in {} parts",
            self.current.len(),
            self.part_count
        );
        self.turns_completed += 1;
        self.part_count = 0;
        std::mem::take(&mut self.current)
    }

    pub fn has_text(&self) -> bool {
        !self.current.is_empty()
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed
    }
}

/// Prints inbound messages to a writer (stdout in the CLI)
pub struct ConsolePresenter<W: Write> {
    out: W,
    turn: TurnAggregator,
}

impl ConsolePresenter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsolePresenter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            turn: TurnAggregator::new(),
        }
    }

    pub fn turn(&self) -> &TurnAggregator {
        &self.turn
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Render one inbound message
    pub fn handle(&mut self, message: &InboundMessage) -> io::Result<()> {
        match message {
            InboundMessage::Text(text) => self.handle_payload(text.as_bytes()),
            // The service may deliver its JSON in binary frames
            InboundMessage::Binary(data) => self.handle_payload(data),
            InboundMessage::Close { code, reason } => {
                self.finish_line()?;
                if reason.is_empty() {
                    log::info!("Server closed the session ({})", code);
                } else {
                    log::info!("Server closed the session ({}: {})", code, reason);
                }
                Ok(())
            }
        }
    }

    fn handle_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        let message: ServerMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Presenter: failed to parse message ({} bytes): {}", payload.len(), e);
                return Ok(());
            }
        };

        if message.is_setup_complete() {
            log::info!("Setup complete, ready for audio");
        }

        if let Some(go_away) = &message.go_away {
            log::warn!(
                "Server is going away (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        if let Some(heard) = message.input_transcript() {
            self.finish_line()?;
            writeln!(self.out, "you: {}", heard.trim())?;
        }

        let text = message
            .model_text()
            .or_else(|| message.output_transcript().map(str::to_string));
        if let Some(text) = text {
            self.turn.push_text(&text);
            write!(self.out, "{}", text)?;
            self.out.flush()?;
        }

        if message.interrupted() {
            log::debug!("Model turn interrupted");
            if self.turn.has_text() {
                write!(self.out, " [interrupted]")?;
            }
            self.finish_line()?;
        }

        if message.turn_complete() {
            self.finish_line()?;
        }

        Ok(())
    }

    /// End the turn in progress, if any, with a newline
    fn finish_line(&mut self) -> io::Result<()> {
        if self.turn.has_text() {
            self.turn.complete_turn();
            writeln!(self.out)?;
            self.out.flush()?;
        }
        Ok(())
    }
}

/// Drain `rx` into the presenter until the sender side is gone
pub async fn run_presenter<W: Write>(
    mut rx: mpsc::Receiver<InboundMessage>,
    mut presenter: ConsolePresenter<W>,
) -> ConsolePresenter<W> {
    while let Some(message) = rx.recv().await {
        if let Err(e) = presenter.handle(&message) {
            log::warn!("Presenter: failed to write output: {}", e);
        }
    }
    if let Err(e) = presenter.finish_line() {
        log::warn!("Presenter: failed to write output: {}", e);
    }
    log::debug!(
        "Presenter: {} turn(s) completed",
        presenter.turn.turns_completed()
    );
    presenter
}
