//! Keyboard controls for the CLI
//!
//! Enter toggles recording, `q` + Enter (or EOF) quits, Ctrl-C interrupts.
//! Stdin is read on a dedicated thread with blocking I/O so a pending read
//! never holds up runtime shutdown.

use std::io::BufRead;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Ignore a second Enter arriving faster than this
const DEBOUNCE: Duration = Duration::from_millis(150);

/// What the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Start or stop recording
    Toggle,
    /// Leave the program after tearing down any session
    Quit,
    /// Ctrl-C
    Interrupt,
}

/// Map one line of input to a control; unknown input is ignored
pub fn parse_command(line: &str) -> Option<Control> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "start" | "stop" => Some(Control::Toggle),
        "q" | "quit" | "exit" => Some(Control::Quit),
        _ => None,
    }
}

/// Forwards keyboard input and Ctrl-C as [`Control`] events
pub struct ControlListener {
    cancel_token: CancellationToken,
}

impl ControlListener {
    /// Start listening. Events go to `tx` until the listener is dropped.
    pub fn start(tx: mpsc::Sender<Control>) -> Self {
        let cancel_token = CancellationToken::new();

        let stdin_tx = tx.clone();
        let stdin_cancel = cancel_token.clone();
        let spawned = std::thread::Builder::new()
            .name("stdin-controls".to_string())
            .spawn(move || read_stdin(stdin_tx, stdin_cancel));
        if let Err(e) = spawned {
            log::error!("Failed to start keyboard listener: {}", e);
        }

        let cancel = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            log::warn!("Ctrl-C handler unavailable: {}", e);
                            break;
                        }
                        log::info!("Interrupt received");
                        if tx.send(Control::Interrupt).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { cancel_token }
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_stdin(tx: mpsc::Sender<Control>, cancel: CancellationToken) {
    let stdin = std::io::stdin();
    let mut last_toggle: Option<std::time::Instant> = None;

    for line in stdin.lock().lines() {
        if cancel.is_cancelled() {
            return;
        }

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Keyboard read error: {}", e);
                break;
            }
        };

        let Some(control) = parse_command(&line) else {
            log::debug!("Ignoring input {:?}", line);
            continue;
        };

        if control == Control::Toggle {
            let now = std::time::Instant::now();
            if last_toggle.map_or(false, |t| now.duration_since(t) < DEBOUNCE) {
                log::trace!("Toggle debounced");
                continue;
            }
            last_toggle = Some(now);
        }

        if tx.blocking_send(control).is_err() {
            return;
        }
    }

    // EOF: behave like quit
    let _ = tx.blocking_send(Control::Quit);
}
