//! Wave-container encoding and header parsing.
//!
//! Pure functions: no I/O, no async runtime.

/// Sample rate of the streaming model's decoder output (24 kHz mono).
pub const SAMPLE_RATE: u32 = 24_000;

/// Bytes in the canonical RIFF/fmt/data header written by [`write_wav`].
pub const HEADER_LEN: usize = 44;

const PCM_FORMAT_TAG: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const FMT_BODY_LEN: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WavError {
    #[error("buffer too short for a RIFF/WAVE header")]
    TooShort,
    #[error("not a RIFF/WAVE container")]
    NotWave,
    #[error("fmt chunk truncated")]
    TruncatedFormat,
    #[error("unsupported wave format tag {0}")]
    NotPcm(u16),
    #[error("data chunk appears before fmt chunk")]
    DataBeforeFormat,
    #[error("no data chunk")]
    MissingData,
}

/// Convert a float waveform to 16-bit PCM, clamping to [-1, 1].
/// Non-finite samples become silence.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| match s.is_finite() {
            true => (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16,
            false => 0,
        })
        .collect()
}

/// Encode a model waveform as a mono 16-bit WAV at [`SAMPLE_RATE`].
pub fn encode_waveform(samples: &[f32]) -> Vec<u8> {
    write_wav(&f32_to_i16(samples), SAMPLE_RATE)
}

/// Serialize 16-bit mono PCM into a canonical 44-byte-header WAV.
pub fn write_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let block_align = BITS_PER_SAMPLE / 8;
    let data_len = (samples.len() * usize::from(block_align)) as u32;

    let mut out = Vec::with_capacity(HEADER_LEN + data_len as usize);
    chunk_head(&mut out, b"RIFF", HEADER_LEN as u32 - 8 + data_len);
    out.extend_from_slice(b"WAVE");

    chunk_head(&mut out, b"fmt ", FMT_BODY_LEN);
    for field in [PCM_FORMAT_TAG, 1] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    for field in [sample_rate, sample_rate * u32::from(block_align)] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    for field in [block_align, BITS_PER_SAMPLE] {
        out.extend_from_slice(&field.to_le_bytes());
    }

    chunk_head(&mut out, b"data", data_len);
    out.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
    out
}

fn chunk_head(out: &mut Vec<u8>, id: &[u8; 4], len: u32) {
    out.extend_from_slice(id);
    out.extend_from_slice(&len.to_le_bytes());
}

/// Format parameters and payload location of a PCM wave buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Byte offset in the buffer where raw PCM data begins.
    pub data_offset: usize,
    /// Length of the data chunk in bytes, capped at what the buffer holds.
    pub data_len: usize,
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Walk the RIFF chunk list after the 12-byte preamble, yielding
/// `(id, body_offset, declared_len)`.
fn chunks(buf: &[u8]) -> impl Iterator<Item = (&[u8], usize, usize)> {
    let mut pos = 12;
    std::iter::from_fn(move || {
        if pos + 8 > buf.len() {
            return None;
        }
        let id = &buf[pos..pos + 4];
        let len = le_u32(buf, pos + 4) as usize;
        let body = pos + 8;
        // chunk bodies are word-aligned
        pos = body.saturating_add(len).saturating_add(len & 1);
        Some((id, body, len))
    })
}

/// Locate the `fmt ` and `data` chunks of a PCM wave buffer.
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, WavError> {
    if buf.len() < 12 {
        return Err(WavError::TooShort);
    }
    if &buf[..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err(WavError::NotWave);
    }

    let mut format = None;
    for (id, body, len) in chunks(buf) {
        match id {
            b"fmt " => {
                if body + 16 > buf.len() {
                    return Err(WavError::TruncatedFormat);
                }
                let tag = le_u16(buf, body);
                if tag != PCM_FORMAT_TAG {
                    return Err(WavError::NotPcm(tag));
                }
                format = Some((le_u16(buf, body + 2), le_u32(buf, body + 4), le_u16(buf, body + 14)));
            }
            b"data" => {
                let (channels, sample_rate, bits_per_sample) =
                    format.ok_or(WavError::DataBeforeFormat)?;
                return Ok(WavHeader {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: body,
                    data_len: len.min(buf.len().saturating_sub(body)),
                });
            }
            _ => {}
        }
    }
    Err(WavError::MissingData)
}
