//! Application entry point: a headless tutoring call.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Install the TLS crypto provider.
//! 3. Load [`AppConfig`] from disk (defaults on first run).
//! 4. Build the cpal microphone and speaker and the WebSocket connector.
//! 5. Spawn the [`SessionManager`] and connect with the configured lesson.
//! 6. Log session events until Ctrl-C, then disconnect and shut down.

use std::sync::Arc;

use live_tutor::{
    audio::{CpalMicrophone, CpalOutput},
    config::AppConfig,
    remote::WebSocketConnector,
    session::{SessionEvent, SessionManager},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Live tutor starting up");

    // 2. TLS
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    // 3. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });
    if config.remote.resolved_api_key().is_none() {
        anyhow::bail!(
            "no API key: set {} or remote.api_key in the settings file",
            live_tutor::config::settings::API_KEY_ENV
        );
    }

    // 4. Devices and transport
    let mic = Arc::new(CpalMicrophone::new(config.audio.capture_frame_size));
    let output = Arc::new(CpalOutput);
    let connector = Arc::new(WebSocketConnector::from_config(&config.remote));

    // 5. Session
    let scenario = config.tutor.scenario.clone();
    let rate = config.tutor.speaking_rate;
    let (manager, handle, mut events) = SessionManager::new(config, mic, output, connector);
    let runner = tokio::spawn(manager.run());
    handle.connect(scenario.as_deref(), rate);

    // 6. Event loop
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-C received, ending the call");
                break;
            }
        }
    }

    handle.disconnect();
    handle.shutdown();
    runner.await?;
    log::info!("Live tutor stopped");
    Ok(())
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => log::info!("state: {state}"),
        SessionEvent::Subtitle(s) => log::info!("tutor: {} ({}) {}", s.hanzi, s.pinyin, s.english),
        SessionEvent::PronunciationFeedback(f) => log::info!(
            "feedback: \"{}\" [{}] {:.0}/100 {}",
            f.user_text,
            f.pinyin,
            f.score,
            f.feedback
        ),
        SessionEvent::UserTranscript(text) => log::info!("you: {text}"),
        SessionEvent::Volume(level) => log::trace!("volume: {level:.2}"),
        SessionEvent::Error { message, fatal } => {
            if *fatal {
                log::error!("{message}");
            } else {
                log::warn!("{message}");
            }
        }
    }
}
