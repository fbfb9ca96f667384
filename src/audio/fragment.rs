//! # Audio Fragments
//!
//! Decoding of wire-level audio payloads into playable fragments, and the
//! reverse conversion used for outbound microphone audio.
//!
//! ## Accepted payloads (base64 encoded):
//! - **WAV**: any PCM or float WAV the `wav` crate reads; multi-channel audio
//!   is downmixed to mono
//! - **Raw PCM**: headerless 16-bit little-endian mono at a declared rate
//!
//! Decoded audio is converted to the playback graph's sample rate so the
//! scheduler never has to resample.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::sync::Arc;

use crate::error::AudioError;

/// One indexed chunk of an utterance's synthesized audio.
#[derive(Debug, Clone)]
pub struct AudioFragment {
    pub utterance_id: String,
    pub fragment_index: u32,
    /// Mono samples in `-1.0..=1.0`
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioFragment {
    pub fn new(
        utterance_id: impl Into<String>,
        fragment_index: u32,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> Self {
        Self {
            utterance_id: utterance_id.into(),
            fragment_index,
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode a base64 payload into a fragment at `target_rate`.
///
/// `raw_pcm_rate` is the rate assumed for headerless payloads.
pub fn decode_fragment(
    utterance_id: &str,
    fragment_index: u32,
    payload_b64: &str,
    raw_pcm_rate: u32,
    target_rate: u32,
) -> Result<AudioFragment, AudioError> {
    let bytes = STANDARD
        .decode(payload_b64.trim())
        .map_err(|e| AudioError::MalformedFragment(format!("invalid base64: {}", e)))?;

    let (samples, source_rate) = if bytes.starts_with(b"RIFF") {
        decode_wav(&bytes)?
    } else {
        (pcm16_to_float(&bytes)?, raw_pcm_rate)
    };

    if samples.is_empty() {
        return Err(AudioError::MalformedFragment(format!(
            "fragment {}#{} contains no audio",
            utterance_id, fragment_index
        )));
    }

    let samples = if source_rate != target_rate {
        resample_linear(&samples, target_rate as f32 / source_rate as f32)
    } else {
        samples
    };

    Ok(AudioFragment::new(
        utterance_id,
        fragment_index,
        samples,
        target_rate,
    ))
}

/// Decode a WAV file image into mono samples and its sample rate.
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32), AudioError> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)
        .map_err(|e| AudioError::MalformedFragment(format!("invalid WAV: {}", e)))?;

    let channels = header.channel_count.max(1) as usize;
    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .iter()
            .map(|&s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => {
            samples.iter().map(|&s| s as f32 / 8_388_608.0).collect()
        }
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    if header.sampling_rate == 0 {
        return Err(AudioError::MalformedFragment(
            "WAV header declares a zero sample rate".to_string(),
        ));
    }

    Ok((downmix(&interleaved, channels), header.sampling_rate))
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Convert 16-bit little-endian PCM bytes to float samples.
pub fn pcm16_to_float(data: &[u8]) -> Result<Vec<f32>, AudioError> {
    if data.len() % 2 != 0 {
        return Err(AudioError::MalformedFragment(
            "PCM data length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Convert float samples to 16-bit little-endian PCM bytes (clamped).
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        // Writing into a Vec cannot fail
        let _ = out.write_i16::<LittleEndian>(scaled);
    }
    out
}

/// Linear-interpolation resampler; `ratio` is target rate / source rate.
pub fn resample_linear(input: &[f32], ratio: f32) -> Vec<f32> {
    let input_len = input.len();
    let output_len = (input_len as f32 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f32 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = src_idx - idx as f32;

        if idx + 1 < input_len {
            output.push(input[idx] * (1.0 - frac) + input[idx + 1] * frac);
        } else {
            output.push(input.last().copied().unwrap_or(0.0));
        }
    }

    output
}
