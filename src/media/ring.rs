use crate::{PcmBuf, Sample};
use std::collections::VecDeque;

/// Bounded pre-speech sample buffer. The keyword gate keeps roughly the last
/// three seconds of microphone audio here so that words spoken just before
/// the formal speech-start event are not lost.
pub struct SampleRing {
    buf: VecDeque<Sample>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Ring sized to hold `duration_ms` of audio at `sample_rate`.
    pub fn with_duration(duration_ms: u64, sample_rate: u32) -> Self {
        Self::new(((sample_rate as u64 * duration_ms) / 1000).max(1) as usize)
    }

    pub fn push_slice(&mut self, samples: &[Sample]) {
        for &sample in samples {
            if self.buf.len() == self.capacity {
                self.buf.pop_front();
            }
            self.buf.push_back(sample);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Oldest-first copy of the buffered audio.
    pub fn snapshot(&self) -> PcmBuf {
        self.buf.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
