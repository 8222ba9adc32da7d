use mp3lame_encoder::{Bitrate, Builder, DualPcm, FlushNoGap, MonoPcm, Quality};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use crate::constants::audio::{MP3_CHUNK_FRAMES, MP3_SAMPLE_RATE};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio decoding failed: {0}")]
    Decode(#[from] SymphoniaError),
    #[error("no audio track found in response")]
    NoAudioTrack,
    #[error("decoded audio contains no samples")]
    Empty,
    #[error("WAV export failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("MP3 export failed: {0}")]
    Mp3(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container of the final assembled file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 320 kbps constant bitrate
    #[default]
    Mp3,
    /// Uncompressed 16-bit PCM
    Wav,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "wav" => Ok(OutputFormat::Wav),
            other => Err(format!("Unknown output format '{}' (expected mp3 or wav)", other)),
        }
    }
}

/// Decoded 16-bit PCM audio, interleaved when `channels > 1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        AudioBuffer {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// A buffer of digital silence lasting `duration_ms`
    pub fn silent(duration_ms: u64, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let frames = (sample_rate as u64 * duration_ms / 1000) as usize;
        AudioBuffer::new(vec![0; frames * channels as usize], sample_rate, channels)
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames() as u64 * 1000 / self.sample_rate as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert to the given sample rate and channel count
    pub fn conform(&self, sample_rate: u32, channels: u16) -> AudioBuffer {
        let channels = channels.max(1);
        if self.sample_rate == sample_rate && self.channels == channels {
            return self.clone();
        }

        let remixed = remix(&self.samples, self.channels, channels);
        let resampled = resample(&remixed, channels, self.sample_rate, sample_rate);
        AudioBuffer::new(resampled, sample_rate, channels)
    }

    /// Write the buffer to `path` in the given container
    pub fn export(&self, path: &Path, format: OutputFormat) -> Result<(), AudioError> {
        match format {
            OutputFormat::Mp3 => self.write_mp3(path),
            OutputFormat::Wav => self.write_wav(path),
        }
    }

    /// Export as 320 kbps MP3
    pub fn write_mp3(&self, path: &Path) -> Result<(), AudioError> {
        fs::write(path, self.encode_mp3()?)?;
        Ok(())
    }

    /// Encode as constant 320 kbps MP3, resampling to 44.1 kHz and at most two channels
    pub fn encode_mp3(&self) -> Result<Vec<u8>, AudioError> {
        let channels = self.channels.min(2);
        let pcm = self.conform(MP3_SAMPLE_RATE, channels);

        let mut builder = Builder::new()
            .ok_or_else(|| AudioError::Mp3("could not allocate LAME encoder".to_string()))?;
        builder.set_num_channels(channels as u8).map_err(lame_error)?;
        builder.set_sample_rate(MP3_SAMPLE_RATE).map_err(lame_error)?;
        builder.set_brate(Bitrate::Kbps320).map_err(lame_error)?;
        builder.set_quality(Quality::Best).map_err(lame_error)?;
        let mut encoder = builder.build().map_err(lame_error)?;

        let mut out = Vec::new();
        if channels == 1 {
            for chunk in pcm.samples.chunks(MP3_CHUNK_FRAMES) {
                out.reserve(mp3lame_encoder::max_required_buffer_size(chunk.len()));
                encoder.encode_to_vec(MonoPcm(chunk), &mut out).map_err(lame_error)?;
            }
        } else {
            for chunk in pcm.samples.chunks(MP3_CHUNK_FRAMES * 2) {
                let left: Vec<i16> = chunk.iter().step_by(2).copied().collect();
                let right: Vec<i16> = chunk.iter().skip(1).step_by(2).copied().collect();
                out.reserve(mp3lame_encoder::max_required_buffer_size(left.len()));
                encoder
                    .encode_to_vec(DualPcm { left: &left, right: &right }, &mut out)
                    .map_err(lame_error)?;
            }
        }

        // LAME needs at least 7200 bytes to flush its last frames
        out.reserve(7200);
        encoder.flush_to_vec::<FlushNoGap>(&mut out).map_err(lame_error)?;

        Ok(out)
    }

    /// Export as 16-bit PCM WAV
    pub fn write_wav(&self, path: &Path) -> Result<(), AudioError> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)?;
        for sample in &self.samples {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;

        Ok(())
    }
}

fn lame_error(e: impl fmt::Debug) -> AudioError {
    AudioError::Mp3(format!("{:?}", e))
}

/// Join buffers in the order given, converting each to the format of the first
pub fn concat(buffers: &[AudioBuffer]) -> Option<AudioBuffer> {
    let first = buffers.first()?;
    let (sample_rate, channels) = (first.sample_rate, first.channels);

    let total: usize = buffers.iter().map(|b| b.samples.len()).sum();
    let mut samples = Vec::with_capacity(total);

    for buffer in buffers {
        if buffer.sample_rate == sample_rate && buffer.channels == channels {
            samples.extend_from_slice(&buffer.samples);
        } else {
            samples.extend_from_slice(&buffer.conform(sample_rate, channels).samples);
        }
    }

    Some(AudioBuffer::new(samples, sample_rate, channels))
}

/// Decode an encoded audio file (MP3 or WAV) held in memory
///
/// `extension` is only a probing hint; the container is detected from the bytes.
pub fn decode(bytes: &[u8], extension: Option<&str>) -> Result<AudioBuffer, AudioError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoAudioTrack)?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())?;

    let mut sample_rate = codec_params.sample_rate;
    let mut channels = codec_params.channels.map(|c| c.count() as u16);
    let mut samples: Vec<i16> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate.get_or_insert(spec.rate);
                channels.get_or_insert(spec.channels.count() as u16);

                let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            // A corrupt frame is skipped, the rest of the stream is still usable
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::debug!("skipping undecodable packet: {}", msg);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if samples.is_empty() {
        return Err(AudioError::Empty);
    }

    Ok(AudioBuffer::new(
        samples,
        sample_rate.unwrap_or(crate::constants::audio::DEFAULT_SAMPLE_RATE),
        channels.unwrap_or(crate::constants::audio::DEFAULT_CHANNELS),
    ))
}

/// Change channel count: down-mix by averaging, up-mix by repeating
fn remix(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    if from == to {
        return samples.to_vec();
    }

    let from = from.max(1) as usize;
    let to = to.max(1) as usize;

    samples
        .chunks(from)
        .flat_map(|frame| {
            let mono = (frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32) as i16;
            if to == 1 {
                vec![mono]
            } else if from == 1 {
                vec![frame[0]; to]
            } else {
                (0..to).map(|ch| frame.get(ch).copied().unwrap_or(mono)).collect()
            }
        })
        .collect()
}

/// Linear-interpolation resampling of interleaved frames
fn resample(input: &[i16], channels: u16, from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }

    let channels = channels.max(1) as usize;
    let in_frames = input.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_frames = (in_frames as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let src_idx = i as f64 * ratio;
        let src_idx_floor = (src_idx.floor() as usize).min(in_frames - 1);
        let src_idx_ceil = (src_idx_floor + 1).min(in_frames - 1);
        let frac = src_idx - src_idx_floor as f64;

        for ch in 0..channels {
            let a = input[src_idx_floor * channels + ch] as f64;
            let b = input[src_idx_ceil * channels + ch] as f64;
            output.push((a * (1.0 - frac) + b * frac).round() as i16);
        }
    }

    output
}
