use crate::{PcmBuf, Sample};
use anyhow::{Result, anyhow};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;

/// Little-endian 16-bit PCM, the wire format of the VAD socket protocol and
/// of every raw audio payload this crate exchanges.
pub fn samples_to_bytes(samples: &[Sample]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

pub fn bytes_to_samples(bytes: &[u8]) -> PcmBuf {
    let usable = bytes.len() - bytes.len() % 2;
    let mut samples = vec![0i16; usable / 2];
    LittleEndian::read_i16_into(&bytes[..usable], &mut samples);
    samples
}

/// Encode a canonical mono 16-bit PCM WAV blob (44-byte header) in memory.
pub fn pcm_to_wav(samples: &[Sample], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV blob into mono PCM, downmixing multi-channel input.
pub fn wav_to_pcm(data: &[u8]) -> Result<(PcmBuf, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let raw: Vec<Sample> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };
    if channels == 1 {
        return Ok((raw, spec.sample_rate));
    }
    let mono = raw
        .chunks_exact(channels)
        .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
        .collect();
    Ok((mono, spec.sample_rate))
}

pub fn read_wav_file(path: &str) -> Result<(PcmBuf, u32)> {
    let data = std::fs::read(path)?;
    wav_to_pcm(&data)
}

/// Linear-interpolation resampler, good enough for the 16 kHz feed the
/// neural VAD sockets expect.
pub fn resample(samples: &[Sample], from_rate: u32, to_rate: u32) -> Result<PcmBuf> {
    if from_rate == 0 || to_rate == 0 {
        return Err(anyhow!("invalid sample rate: {} -> {}", from_rate, to_rate));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = (samples.len() - 1) as f64 / (out_len.max(2) - 1) as f64;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f64;
        let a = samples[idx] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as Sample);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let samples: PcmBuf = vec![0, 1, -1, i16::MAX, i16::MIN];
        let bytes = samples_to_bytes(&samples);
        assert_eq!(bytes.len(), samples.len() * 2);
        assert_eq!(bytes_to_samples(&bytes), samples);
    }

    #[test]
    fn test_wav_header_is_canonical() {
        let wav = pcm_to_wav(&[0i16; 160], 16000).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // header + 160 samples * 2 bytes
        assert_eq!(wav.len(), 44 + 320);
        let (pcm, rate) = wav_to_pcm(&wav).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(pcm.len(), 160);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: PcmBuf = (0..320).map(|i| i as i16).collect();
        let out = resample(&samples, 32000, 16000).unwrap();
        assert_eq!(out.len(), 160);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_resample_identity() {
        let samples: PcmBuf = vec![5, -3, 7];
        assert_eq!(resample(&samples, 16000, 16000).unwrap(), samples);
    }
}
