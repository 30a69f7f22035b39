//! # Audio Processing
//!
//! The fixed processing chain applied to captured audio before it is framed,
//! and the conversions used on both the capture and the playback side.
//!
//! ## Capture chain:
//! source → dynamics compressor → gain (unity) → soft clip → 16-bit quantize
//!
//! ## Wire format:
//! Little-endian signed 16-bit PCM, base64-encoded inside JSON `audio` messages
//! and sent raw inside binary frames.

use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Samples are clamped to this magnitude before quantization.
pub const SOFT_CLIP_LIMIT: f32 = 0.99;

/// Full-scale value used for both quantization and dequantization.
const PCM_SCALE: f32 = 32767.0;

/// Level assigned to digital silence when converting to decibels.
const SILENCE_DB: f32 = -120.0;

/// Parameters of the dynamics compressor.
///
/// ## Defaults:
/// threshold −50 dB, knee 40 dB, ratio 12:1, attack 0 s, release 0.25 s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorSettings {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_secs: f32,
    pub release_secs: f32,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        Self {
            threshold_db: -50.0,
            knee_db: 40.0,
            ratio: 12.0,
            attack_secs: 0.0,
            release_secs: 0.25,
        }
    }
}

/// Feed-forward soft-knee compressor with automatic makeup gain.
///
/// ## Method:
/// 1. Convert each sample's magnitude to dB
/// 2. Run it through the static soft-knee curve to get the target reduction
/// 3. Smooth the reduction with the attack (falling) / release (rising) coefficients
/// 4. Apply reduction plus makeup gain
///
/// The makeup gain follows the browser compressor: 0.6 × the reduction the
/// curve applies to a full-scale (0 dB) input.
#[derive(Debug, Clone)]
pub struct DynamicsCompressor {
    settings: CompressorSettings,
    attack_coeff: f32,
    release_coeff: f32,
    makeup_db: f32,
    /// Current smoothed gain reduction in dB (always <= 0)
    reduction_db: f32,
}

impl DynamicsCompressor {
    pub fn new(settings: CompressorSettings, sample_rate: u32) -> Self {
        let mut compressor = Self {
            settings,
            attack_coeff: smoothing_coefficient(settings.attack_secs, sample_rate),
            release_coeff: smoothing_coefficient(settings.release_secs, sample_rate),
            makeup_db: 0.0,
            reduction_db: 0.0,
        };
        compressor.makeup_db = -0.6 * (compressor.static_curve(0.0) - 0.0);
        compressor
    }

    pub fn settings(&self) -> &CompressorSettings {
        &self.settings
    }

    /// Output level in dB for a steady input level in dB.
    pub fn static_curve(&self, input_db: f32) -> f32 {
        let CompressorSettings { threshold_db, knee_db, ratio, .. } = self.settings;
        let overshoot = input_db - threshold_db;

        if 2.0 * overshoot < -knee_db {
            input_db
        } else if knee_db > 0.0 && 2.0 * overshoot.abs() <= knee_db {
            let x = overshoot + knee_db / 2.0;
            input_db + (1.0 / ratio - 1.0) * x * x / (2.0 * knee_db)
        } else {
            threshold_db + overshoot / ratio
        }
    }

    /// Compress a block in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let level_db = amplitude_to_db(sample.abs());
            let target = self.static_curve(level_db) - level_db;

            let coeff = if target < self.reduction_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.reduction_db = coeff * self.reduction_db + (1.0 - coeff) * target;

            *sample *= db_to_amplitude(self.reduction_db + self.makeup_db);
        }
    }

    /// Forget the envelope state (used when a new capture stream starts).
    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }
}

/// Multiplies every sample by a fixed factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainStage {
    pub gain: f32,
}

impl GainStage {
    pub fn unity() -> Self {
        Self { gain: 1.0 }
    }

    pub fn process(&self, samples: &mut [f32]) {
        if (self.gain - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in samples.iter_mut() {
            *sample *= self.gain;
        }
    }
}

/// The per-frame processor: compressor → gain → clip → quantize.
#[derive(Debug, Clone)]
pub struct FrameProcessor {
    compressor: DynamicsCompressor,
    gain: GainStage,
}

impl FrameProcessor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            compressor: DynamicsCompressor::new(CompressorSettings::default(), sample_rate),
            gain: GainStage::unity(),
        }
    }

    /// Run one frame of mono samples through the chain and quantize it.
    pub fn process(&mut self, frame: &[f32]) -> Vec<i16> {
        let mut samples = frame.to_vec();
        self.compressor.process(&mut samples);
        self.gain.process(&mut samples);
        samples.into_iter().map(|s| quantize(soft_clip(s))).collect()
    }

    pub fn reset(&mut self) {
        self.compressor.reset();
    }
}

/// Clamp to [−0.99, 0.99]; non-finite input becomes silence.
pub fn soft_clip(sample: f32) -> f32 {
    if !sample.is_finite() {
        return 0.0;
    }
    sample.clamp(-SOFT_CLIP_LIMIT, SOFT_CLIP_LIMIT)
}

/// Scale a [−1, 1] float sample to i16 with rounding.
pub fn quantize(sample: f32) -> i16 {
    (sample * PCM_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert 16-bit PCM samples to floats in [−1, 1].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / PCM_SCALE).collect()
}

/// Serialize samples as little-endian bytes.
pub fn encode_pcm_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Parse little-endian 16-bit PCM.
///
/// ## Errors:
/// An odd byte count cannot be split into whole samples and is rejected as a
/// protocol error.
pub fn decode_pcm_le(data: &[u8]) -> VoiceResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(VoiceError::Protocol(format!(
            "Audio payload length {} is not a whole number of 16-bit samples",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// PCM → little-endian bytes → base64, the `data` field of an `audio` message.
pub fn encode_frame_base64(samples: &[i16]) -> String {
    STANDARD.encode(encode_pcm_le(samples))
}

/// Reverse of [`encode_frame_base64`].
pub fn decode_frame_base64(data: &str) -> VoiceResult<Vec<i16>> {
    let bytes = STANDARD.decode(data.trim())?;
    decode_pcm_le(&bytes)
}

/// Linear-interpolation resampler used when the output device cannot run at
/// the playback rate.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let index = pos.floor() as usize;
            let frac = (pos - index as f64) as f32;
            let a = samples[index.min(samples.len() - 1)];
            let b = samples[(index + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

fn amplitude_to_db(amplitude: f32) -> f32 {
    if amplitude <= 1e-6 {
        SILENCE_DB
    } else {
        20.0 * amplitude.log10()
    }
}

fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// One-pole smoothing coefficient; a zero time constant means "jump immediately".
fn smoothing_coefficient(time_secs: f32, sample_rate: u32) -> f32 {
    if time_secs <= 0.0 || sample_rate == 0 {
        0.0
    } else {
        (-1.0 / (time_secs * sample_rate as f32)).exp()
    }
}
