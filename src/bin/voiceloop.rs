use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voiceloop::call::CallSessionBuilder;
use voiceloop::config::{Cli, Config};
use voiceloop::event::create_event_channel;
use voiceloop::llm::HttpChatClient;
use voiceloop::media::sink::PacedSink;
use voiceloop::media::source::WavFileSource;
use voiceloop::synthesis::HttpTtsClient;
use voiceloop::transcription::HttpAsrClient;

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if let Some(log_file) = &config.log_file {
        let path = Path::new(log_file);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file = path.file_name().map(|f| f.to_string_lossy().to_string());
        let appender =
            tracing_appender::rolling::never(dir, file.unwrap_or_else(|| "voiceloop.log".into()));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.conf.as_deref().unwrap_or("voiceloop.toml"));
    let _log_guard = init_logging(&config);

    let input = cli
        .input
        .ok_or_else(|| anyhow!("--input <wav file> is required to drive the microphone feed"))?;
    let source = Arc::new(WavFileSource::from_file(&input)?);
    let sink = PacedSink::new();

    let asr = Arc::new(HttpAsrClient::new(config.asr.clone()));
    let tts = Arc::new(HttpTtsClient::new(config.tts.clone()));
    let chat = Arc::new(HttpChatClient::new(config.llm.clone()));

    let session_events = create_event_channel();
    let mut events_rx = session_events.subscribe();
    let output_sample_rate = config.tts.output_sample_rate;

    let (session, handle) = CallSessionBuilder::new(config.call.clone())
        .with_source(source)
        .with_sink(sink)
        .with_asr(asr)
        .with_tts(tts)
        .with_chat(chat)
        .with_session_events(session_events)
        .with_output_sample_rate(output_sample_rate)
        .build()?;

    tokio::spawn(session.run());
    tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            match event {
                voiceloop::event::SessionEvent::Status { status, .. } => {
                    info!(%status, "session status");
                }
                voiceloop::event::SessionEvent::AsrFinal { text, .. } => {
                    info!(%text, "heard");
                }
                voiceloop::event::SessionEvent::LlmFinal { text, .. } => {
                    info!(%text, "reply");
                }
                _ => {}
            }
        }
    });

    info!("starting call, ctrl-c to hang up");
    handle.start_call();
    tokio::signal::ctrl_c().await?;
    handle.end_call();
    // Give the teardown transition a moment to run before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
