pub mod audio;
pub mod controls;
pub mod credentials;
pub mod presenter;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::future::Future;
use std::io::BufRead;
use std::sync::Arc;

use tokio::sync::mpsc;

use audio::{AudioChunk, AudioRecorder};
use controls::{Control, ControlListener};
use presenter::{run_presenter, ConsolePresenter};
use settings::AppSettings;
use streaming::{receive_loop, FrameSink, LiveSession, ReceiveOutcome, StreamingError, WsSink};

/// Capacity of the channel between the receive loop and the presenter
const INBOUND_QUEUE: usize = 64;

/// How a recording session ended, from the user's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Stopped with Enter; ready for another recording
    Stopped,
    /// Quit or interrupted; leave the program
    Quit,
}

/// What the process was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Interactive streaming client
    Run,
    /// Read a key from stdin and store it in the system keyring
    StoreKey,
    /// Delete the stored key
    ForgetKey,
}

/// Parse the arguments after the program name
pub fn parse_args<I, S>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    let command = match args.next() {
        None => Command::Run,
        Some(arg) => match arg.as_ref() {
            "store-key" => Command::StoreKey,
            "forget-key" => Command::ForgetKey,
            other => {
                return Err(format!(
                    "unknown command {:?} (expected store-key or forget-key)",
                    other
                ))
            }
        },
    };

    if let Some(extra) = args.next() {
        return Err(format!("unexpected argument {:?}", extra.as_ref()));
    }
    Ok(command)
}

/// Run `command` to completion
pub async fn execute(command: Command) -> Result<(), String> {
    match command {
        Command::Run => run().await,
        Command::StoreKey => {
            eprintln!("Paste your Gemini API key and press Enter:");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|e| format!("Failed to read key: {}", e))?;
            credentials::store_api_key(Some(&line))?;
            eprintln!("API key stored in the system keyring.");
            Ok(())
        }
        Command::ForgetKey => {
            credentials::store_api_key(None)?;
            eprintln!("Stored API key removed.");
            Ok(())
        }
    }
}

/// Install the log subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Logs go to stderr so stdout only carries responses
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

/// Run the interactive client until the user quits
pub async fn run() -> Result<(), String> {
    // Missing credentials abort before any connection attempt
    let api_key = credentials::resolve_api_key()
        .ok_or_else(|| StreamingError::MissingApiKey.to_string())?;
    log::info!("Using API key {}", credentials::masked(&api_key));

    let settings = settings::load_settings();
    log::info!("Model: {}", settings.model);

    let (control_tx, mut control_rx) = mpsc::channel::<Control>(8);
    let _controls = ControlListener::start(control_tx);

    loop {
        println!("Press Enter to start recording, q + Enter to quit.");

        if session_end(control_rx.recv().await) == SessionEnd::Quit {
            break;
        }

        match run_session(&api_key, &settings, &mut control_rx).await {
            Ok(SessionEnd::Stopped) => {}
            Ok(SessionEnd::Quit) => break,
            Err(e) => log::error!("Session failed: {}", e),
        }
    }

    log::info!("Goodbye");
    Ok(())
}

/// One recording: connect, set up, stream until the user stops, drain, close
async fn run_session(
    api_key: &str,
    settings: &AppSettings,
    control_rx: &mut mpsc::Receiver<Control>,
) -> Result<SessionEnd, String> {
    let recorder = AudioRecorder::new().map_err(|e| e.to_string())?;

    // The handshake may retry for a while; the user can still stop or quit
    let connect = LiveSession::<WsSink>::connect(&settings.endpoint_url, api_key);
    let (session, stream) = match unless_stopped(connect, control_rx).await {
        Ok(connected) => connected.map_err(|e| e.to_string())?,
        Err(end) => {
            log::info!("Connection attempt abandoned");
            return Ok(end);
        }
    };
    let session = Arc::new(session);

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let receiver = tokio::spawn(receive_loop(
        stream,
        session.cancellation(),
        settings.grace_window(),
        inbound_tx,
    ));
    let presenter = tokio::spawn(run_presenter(inbound_rx, ConsolePresenter::stdout()));

    if let Err(e) = session.send_setup(&settings.setup_config()).await {
        abort_session(&session, "setup failed").await;
        finish_tasks(receiver, presenter).await;
        return Err(e.to_string());
    }

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<AudioChunk>(settings.queue_capacity());
    let recording = match recorder.start(chunk_tx, settings.capture_config()) {
        Ok(handle) => handle,
        Err(e) => {
            abort_session(&session, "audio capture failed").await;
            finish_tasks(receiver, presenter).await;
            return Err(e.to_string());
        }
    };

    let sender = {
        let session = session.clone();
        tokio::spawn(async move { session.stream_audio(&mut chunk_rx).await })
    };

    println!("Recording... press Enter to stop.");

    let end = session_end(control_rx.recv().await);

    // Closing the queue lets the sender drain what was captured
    recording.stop();
    match sender.await {
        Ok(Ok(stats)) => log::info!(
            "Sent {} chunk(s) ({} ms, {} bytes), {} failed",
            stats.chunks_sent,
            stats.audio_ms_sent,
            stats.bytes_sent,
            stats.chunks_failed
        ),
        Ok(Err(e)) => log::warn!("Audio stream ended early: {}", e),
        Err(e) => log::warn!("Audio sender task failed: {}", e),
    }

    if let Err(e) = session.signal_end().await {
        log::warn!("{}", e);
    }

    // Soft cancellation: trailing responses may arrive during the grace window
    session.cancel();
    match receiver.await {
        Ok(outcome) => note_receive_outcome(&session, &outcome),
        Err(e) => log::warn!("Receive task failed: {}", e),
    }

    session.close("client finished").await;
    if let Err(e) = presenter.await {
        log::warn!("Presenter task failed: {}", e);
    }

    Ok(end)
}

/// Map a control (or a closed control channel) to how the session ends
fn session_end(control: Option<Control>) -> SessionEnd {
    match control {
        Some(Control::Toggle) => SessionEnd::Stopped,
        Some(Control::Quit) | Some(Control::Interrupt) | None => SessionEnd::Quit,
    }
}

/// Run `work` unless a control arrives first
async fn unless_stopped<F: Future>(
    work: F,
    control_rx: &mut mpsc::Receiver<Control>,
) -> Result<F::Output, SessionEnd> {
    tokio::select! {
        biased;

        control = control_rx.recv() => Err(session_end(control)),
        output = work => Ok(output),
    }
}

/// Log how the receive loop ended; a server close means `close` has nothing to send
fn note_receive_outcome<S: FrameSink>(session: &LiveSession<S>, outcome: &ReceiveOutcome) {
    match outcome {
        ReceiveOutcome::Closed { .. } | ReceiveOutcome::StreamEnded => {
            session.mark_peer_closed();
            log::debug!("Receive loop finished: {:?}", outcome);
        }
        ReceiveOutcome::TransportFailed(e) => log::warn!("Receive loop failed: {}", e),
        ReceiveOutcome::GraceExpired => log::debug!("Receive loop finished: {:?}", outcome),
    }
}

/// Cancel and close after a fatal session error
async fn abort_session<S: FrameSink>(session: &LiveSession<S>, reason: &str) {
    log::warn!("Session {}: aborting ({})", session.id(), reason);
    session.cancel();
    session.close(reason).await;
}

async fn finish_tasks<W: std::io::Write>(
    receiver: tokio::task::JoinHandle<ReceiveOutcome>,
    presenter: tokio::task::JoinHandle<ConsolePresenter<W>>,
) {
    if let Err(e) = receiver.await {
        log::warn!("Receive task failed: {}", e);
    }
    if let Err(e) = presenter.await {
        log::warn!("Presenter task failed: {}", e);
    }
}
