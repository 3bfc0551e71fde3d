use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    voice_live::init_logging();

    let result = match voice_live::parse_args(std::env::args().skip(1)) {
        Ok(command) => voice_live::execute(command).await,
        Err(e) => Err(format!("{}\nusage: voice-live [store-key | forget-key]", e)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
