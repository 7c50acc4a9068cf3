use std::path::Path;

use voicelink::{SessionConfig, VoiceSession};

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let url = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOICELINK_URL").ok());

    let url = match url {
        Some(url) => url,
        None => {
            eprintln!("usage: voicelink <wss-url>");
            eprintln!("       (or set VOICELINK_URL)");
            std::process::exit(2);
        }
    };

    let mut config = SessionConfig::load(Path::new("voicelink.json"));
    config.url = url;

    log::info!("voicelink starting, endpoint {}", config.url);

    let session = VoiceSession::spawn(config, |state| {
        println!("[{}]", state);
    });

    session.start().await;

    // Run until interrupted
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Interrupt received, shutting down"),
        Err(e) => log::error!("Failed to listen for interrupt: {}", e),
    }

    session.close().await;
}
