use crate::call::CallOption;
use crate::llm::LlmOption;
use crate::synthesis::SynthesisOption;
use crate::transcription::TranscriptionOption;
use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "voiceloop.toml")]
    pub conf: Option<String>,

    /// WAV file driving the microphone input instead of a live device.
    #[clap(long)]
    pub input: Option<String>,
}

fn default_config_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_config_log_level")]
    pub log_level: String,
    pub log_file: Option<String>,
    pub call: CallOption,
    pub asr: TranscriptionOption,
    pub tts: SynthesisOption,
    pub llm: LlmOption,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_config_log_level(),
            log_file: None,
            call: CallOption::default(),
            asr: TranscriptionOption::default(),
            tts: SynthesisOption::default(),
            llm: LlmOption::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.check_default();
        Ok(config)
    }

    /// Best-effort load: a missing file is just the defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("config {} not loaded ({}), using defaults", path, e);
                let mut config = Config::default();
                config.check_default();
                config
            }
        }
    }

    /// Environment fallbacks for every secret/endpoint not set in the file.
    pub fn check_default(&mut self) -> &Self {
        self.asr.check_default();
        self.tts.check_default();
        self.llm.check_default();
        if self.call.vad.socket.endpoint.is_none() {
            self.call.vad.socket.endpoint = std::env::var("VOICELOOP_VAD_ENDPOINT").ok();
        }
        self
    }
}
