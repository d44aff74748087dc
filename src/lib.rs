pub mod call;
pub mod config;
pub mod event;
pub mod llm;
pub mod media;
pub mod segmenter;
pub mod synthesis;
pub mod transcription;
pub mod tts_player;

/// A single signed 16-bit PCM sample, the native unit of every audio path
/// in this crate.
pub type Sample = i16;
pub type PcmBuf = Vec<Sample>;

/// Identifies one call session across events and logs.
pub type SessionId = String;

#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    PCM { samples: PcmBuf },
    Empty,
}

/// One chunk of decoded audio as it moves between sources, analyzers and
/// sinks.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Samples,
    pub sample_rate: u32,
    pub timestamp: u64,
}

impl AudioFrame {
    pub fn pcm(samples: PcmBuf, sample_rate: u32) -> Self {
        Self {
            samples: Samples::PCM { samples },
            sample_rate,
            timestamp: get_timestamp(),
        }
    }

    /// Frame length in milliseconds, zero for empty frames.
    pub fn duration_ms(&self) -> u64 {
        match &self.samples {
            Samples::PCM { samples } if self.sample_rate > 0 => {
                (samples.len() as u64 * 1000) / self.sample_rate as u64
            }
            _ => 0,
        }
    }
}

impl From<(PcmBuf, u32)> for AudioFrame {
    fn from((samples, sample_rate): (PcmBuf, u32)) -> Self {
        AudioFrame {
            samples: Samples::PCM { samples },
            sample_rate,
            timestamp: get_timestamp(),
        }
    }
}

pub fn get_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
