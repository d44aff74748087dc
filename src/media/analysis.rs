use crate::Sample;
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// Lower edge of the human voice band used by the spectral detector.
pub const VOICE_BAND_LO_HZ: f32 = 85.0;
/// Upper edge of the human voice band.
pub const VOICE_BAND_HI_HZ: f32 = 3000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandMetrics {
    /// Sum of squared magnitudes over every bin.
    pub total_energy: f32,
    /// Sum of squared magnitudes restricted to the requested band.
    pub band_energy: f32,
    /// Mean squared magnitude per band bin.
    pub band_avg: f32,
    /// band_energy / total_energy, 0 when the frame is silent.
    pub ratio: f32,
}

/// Reusable FFT worker behind AudioLevel and the spectral VAD. One instance
/// per analysis loop; not shareable across tasks.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    size: usize,
    sample_rate: u32,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new(size: usize, sample_rate: u32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let input = fft.make_input_vec();
        let output = fft.make_output_vec();
        Self {
            fft,
            size,
            sample_rate,
            input,
            output,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Truncates or zero-pads the frame to the FFT size and runs the
    /// transform. Returns false on an internal FFT failure.
    fn transform(&mut self, samples: &[Sample]) -> bool {
        for (i, slot) in self.input.iter_mut().enumerate() {
            *slot = samples
                .get(i)
                .map(|&s| s as f32 / 32768.0)
                .unwrap_or(0.0);
        }
        self.fft.process(&mut self.input, &mut self.output).is_ok()
    }

    /// Mean magnitude across all frequency bins, scaled to 0..=255.
    pub fn audio_level(&mut self, samples: &[Sample]) -> u8 {
        if samples.is_empty() || !self.transform(samples) {
            return 0;
        }
        let bins = self.output.len().max(1);
        let mean: f32 =
            self.output.iter().map(|c| c.norm()).sum::<f32>() / bins as f32;
        // Normalize so a full-scale tone lands near the top of the range.
        let scaled = mean / (self.size as f32 / 2.0) * 255.0 * 64.0;
        scaled.clamp(0.0, 255.0) as u8
    }

    /// Total vs band-limited spectral energy for one frame.
    pub fn band_metrics(&mut self, samples: &[Sample], lo_hz: f32, hi_hz: f32) -> BandMetrics {
        if samples.is_empty() || !self.transform(samples) {
            return BandMetrics::default();
        }
        let bin_hz = self.sample_rate as f32 / self.size as f32;
        let mut total = 0.0f32;
        let mut band = 0.0f32;
        let mut band_bins = 0usize;
        for (i, c) in self.output.iter().enumerate() {
            let energy = c.norm_sqr();
            total += energy;
            let freq = i as f32 * bin_hz;
            if freq >= lo_hz && freq <= hi_hz {
                band += energy;
                band_bins += 1;
            }
        }
        BandMetrics {
            total_energy: total,
            band_energy: band,
            band_avg: if band_bins > 0 { band / band_bins as f32 } else { 0.0 },
            ratio: if total > 0.0 { band / total } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, len: usize, amplitude: f32) -> Vec<Sample> {
        (0..len)
            .map(|i| {
                let t = i as f32 / rate as f32;
                (amplitude * (2.0 * std::f32::consts::PI * freq * t).sin() * 32767.0) as Sample
            })
            .collect()
    }

    #[test]
    fn test_silence_is_level_zero() {
        let mut analyzer = SpectrumAnalyzer::new(512, 16000);
        assert_eq!(analyzer.audio_level(&vec![0i16; 512]), 0);
        assert_eq!(analyzer.audio_level(&[]), 0);
    }

    #[test]
    fn test_louder_signal_has_higher_level() {
        let mut analyzer = SpectrumAnalyzer::new(512, 16000);
        let quiet = analyzer.audio_level(&sine(440.0, 16000, 512, 0.05));
        let loud = analyzer.audio_level(&sine(440.0, 16000, 512, 0.9));
        assert!(loud > quiet, "loud={} quiet={}", loud, quiet);
    }

    #[test]
    fn test_voice_band_tone_dominates_ratio() {
        let mut analyzer = SpectrumAnalyzer::new(512, 16000);
        let voice = analyzer.band_metrics(
            &sine(440.0, 16000, 512, 0.8),
            VOICE_BAND_LO_HZ,
            VOICE_BAND_HI_HZ,
        );
        let hiss = analyzer.band_metrics(
            &sine(6000.0, 16000, 512, 0.8),
            VOICE_BAND_LO_HZ,
            VOICE_BAND_HI_HZ,
        );
        assert!(voice.ratio > 0.8, "voice ratio {}", voice.ratio);
        assert!(hiss.ratio < 0.3, "hiss ratio {}", hiss.ratio);
        assert!(voice.band_avg > hiss.band_avg);
    }
}
