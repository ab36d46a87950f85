//! Audio codec utilities: mulaw <-> linear PCM, rate conversion, WAV framing.
//!
//! The carrier speaks 8 kHz mono mulaw (ITU-T G.711); the TTS adapter returns
//! 24 kHz mono linear PCM. Everything in this module is a pure function over
//! byte slices so it can be unit tested without any I/O.

use base64::Engine as _;

pub const CARRIER_SAMPLE_RATE: u32 = 8_000;
pub const TTS_SAMPLE_RATE: u32 = 24_000;
pub const STT_SAMPLE_RATE: u32 = 16_000;

/// G.711 mulaw decode table is derived rather than stored; BIAS/CLIP are the
/// standard ITU-T constants.
const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Decode one mulaw byte to a linear 16-bit PCM sample.
pub fn mulaw_byte_to_linear(u_val: u8) -> i16 {
    let u_val = !u_val;
    let t = (((u_val & 0x0F) as i16) << 3) + MULAW_BIAS;
    let t = t << ((u_val & 0x70) >> 4);
    if u_val & 0x80 != 0 {
        MULAW_BIAS - t
    } else {
        t - MULAW_BIAS
    }
}

/// Encode one linear 16-bit PCM sample to a mulaw byte.
pub fn linear_to_mulaw_byte(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x80u8 } else { 0 };
    let mut sample = if sample < 0 {
        sample.saturating_neg()
    } else {
        sample
    };
    if sample > MULAW_CLIP {
        sample = MULAW_CLIP;
    }
    sample += MULAW_BIAS;

    let mut exponent: u8 = 7;
    for (exp, mask) in [
        (7u8, 0x4000i16),
        (6, 0x2000),
        (5, 0x1000),
        (4, 0x0800),
        (3, 0x0400),
        (2, 0x0200),
        (1, 0x0100),
        (0, 0x0080),
    ] {
        if sample & mask != 0 {
            exponent = exp;
            break;
        }
    }
    let mantissa = (sample >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa as u8)
}

/// Decode a mulaw byte stream to little-endian 16-bit linear PCM.
pub fn mulaw_to_pcm(mulaw: &[u8]) -> Vec<i16> {
    mulaw.iter().map(|&b| mulaw_byte_to_linear(b)).collect()
}

/// Encode linear PCM samples to a mulaw byte stream.
pub fn pcm_to_mulaw(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| linear_to_mulaw_byte(s)).collect()
}

/// Linear-interpolation resampling between arbitrary sample rates.
///
/// Not a high-fidelity resampler (no anti-aliasing filter), but adequate for
/// 8kHz<->24kHz telephony/TTS conversion and dependency-free.
pub fn resample_linear(pcm: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || pcm.is_empty() {
        return pcm.to_vec();
    }
    let ratio = to_hz as f64 / from_hz as f64;
    let out_len = ((pcm.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;
        let a = pcm.get(idx).copied().unwrap_or(0) as f64;
        let b = pcm.get(idx + 1).copied().unwrap_or(a as i16) as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

/// Root-mean-square energy of a linear PCM buffer.
pub fn pcm_rms(pcm: &[i16]) -> f64 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / pcm.len() as f64).sqrt()
}

/// RMS energy of a raw mulaw frame, computed after linearization.
pub fn mulaw_rms(mulaw: &[u8]) -> f64 {
    pcm_rms(&mulaw_to_pcm(mulaw))
}

/// Wrap linear PCM samples in a minimal RIFF/WAVE header.
///
/// Mirrors the canonical `struct.pack('<4sI4s4sIHHIIHH4sI', ...)` layout:
/// a 16-byte PCM `fmt ` chunk followed by the `data` chunk.
pub fn wrap_wav(pcm: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * block_align as u32;
    let data_size = (pcm.len() * 2) as u32;
    let file_size = 36 + data_size;

    let mut out = Vec::with_capacity(44 + pcm.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    for sample in pcm {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(s)
}

pub fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Prepare a caller utterance (raw 8kHz mulaw bytes) as a 16kHz WAV blob
/// suitable for the STT adapter: decode, then upsample before framing, since
/// the transcription endpoint expects 16kHz input.
pub fn prepare_for_stt(mulaw: &[u8]) -> Vec<u8> {
    let pcm = mulaw_to_pcm(mulaw);
    let pcm_16k = resample_linear(&pcm, CARRIER_SAMPLE_RATE, STT_SAMPLE_RATE);
    wrap_wav(&pcm_16k, STT_SAMPLE_RATE, 1)
}

/// Prepare synthesized 24kHz PCM for transmission back to the carrier:
/// downsample to 8kHz, encode mulaw, base64 the result.
pub fn prepare_for_carrier(pcm_24k: &[i16]) -> String {
    let pcm_8k = resample_linear(pcm_24k, TTS_SAMPLE_RATE, CARRIER_SAMPLE_RATE);
    let mulaw = pcm_to_mulaw(&pcm_8k);
    base64_encode(&mulaw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_is_bounded() {
        let original: Vec<i16> = (0..200).map(|i| ((i * 137) % 4000) - 2000).collect();
        let encoded = pcm_to_mulaw(&original);
        let decoded = mulaw_to_pcm(&encoded);
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert!((*a - *b).abs() <= 260, "quantization error too large: {a} vs {b}");
        }
    }

    #[test]
    fn silence_has_near_zero_rms() {
        let silence = vec![0i16; 160];
        assert!(pcm_rms(&silence) < 1.0);
    }

    #[test]
    fn tone_has_higher_rms_than_silence() {
        let tone: Vec<i16> = (0..160).map(|i| if i % 2 == 0 { 4000 } else { -4000 }).collect();
        assert!(pcm_rms(&tone) > 1000.0);
    }

    #[test]
    fn resample_preserves_duration_ratio() {
        let pcm = vec![0i16; 8000];
        let up = resample_linear(&pcm, 8000, 24000);
        assert_eq!(up.len(), 24000);
        let down = resample_linear(&up, 24000, 8000);
        assert_eq!(down.len(), 8000);
    }

    #[test]
    fn wav_header_has_expected_layout() {
        let pcm = vec![1i16, -1, 2, -2];
        let wav = wrap_wav(&pcm, 8000, 1);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(wav.len(), 44 + pcm.len() * 2);
    }

    #[test]
    fn prepare_for_stt_upsamples_to_16khz() {
        let mulaw = vec![0xFFu8; 800]; // 100ms @ 8kHz
        let wav = prepare_for_stt(&mulaw);
        let sample_rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sample_rate, STT_SAMPLE_RATE);
        let data_size = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]) as usize;
        assert_eq!(data_size / 2, 1600); // 100ms @ 16kHz
    }

    #[test]
    fn base64_round_trips() {
        let bytes = vec![0u8, 255, 127, 1, 2, 3];
        let encoded = base64_encode(&bytes);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(bytes, decoded);
    }
}
