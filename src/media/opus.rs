//! Opus audio codec

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::{info, trace};

use super::codec::{AudioDecoder, AudioEncoder, DecodedAudioFrame, RawAudioFrame};
use crate::config::AudioCodecConfig;
use crate::error::{AppError, Result};
use crate::protocol::{EncodedChunk, MediaKind};

/// Max Opus packet size
const MAX_PACKET_BYTES: usize = 4000;

/// 120ms at 48kHz, the longest Opus frame
const MAX_FRAME_SAMPLES: usize = 5760;

fn codec_error(reason: String) -> AppError {
    AppError::CodecConfiguration {
        kind: MediaKind::Audio,
        reason,
    }
}

fn to_sample_rate(rate: u32) -> Result<SampleRate> {
    match rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        other => Err(codec_error(format!("Unsupported Opus sample rate {}", other))),
    }
}

fn to_channels(channels: u8) -> Channels {
    if channels == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    }
}

/// Opus encoder
pub struct OpusEncoder {
    encoder: Encoder,
    output_buffer: Vec<u8>,
    frame_count: u64,
}

impl OpusEncoder {
    pub fn new(config: &AudioCodecConfig) -> Result<Self> {
        let mut encoder = Encoder::new(
            to_sample_rate(config.sample_rate)?,
            to_channels(config.channels),
            Application::Audio,
        )
        .map_err(|e| codec_error(format!("Failed to create Opus encoder: {:?}", e)))?;

        encoder
            .set_bitrate(Bitrate::BitsPerSecond(config.bitrate_bps as i32))
            .map_err(|e| codec_error(format!("Failed to set bitrate: {:?}", e)))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| codec_error(format!("Failed to enable FEC: {:?}", e)))?;

        info!(
            "Opus encoder created: {}Hz {}ch {}bps",
            config.sample_rate, config.channels, config.bitrate_bps
        );

        Ok(Self {
            encoder,
            output_buffer: vec![0u8; MAX_PACKET_BYTES],
            frame_count: 0,
        })
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, frame: &RawAudioFrame) -> Result<EncodedChunk> {
        let encoded_len = self
            .encoder
            .encode(&frame.samples, &mut self.output_buffer)
            .map_err(|e| AppError::Internal(format!("Opus encode failed: {:?}", e)))?;

        self.frame_count += 1;
        trace!("Encoded {} samples to {} bytes Opus", frame.samples.len(), encoded_len);

        Ok(EncodedChunk::key(
            frame.timestamp_micros,
            Bytes::copy_from_slice(&self.output_buffer[..encoded_len]),
        ))
    }

    fn name(&self) -> &str {
        "opus"
    }
}

/// Opus decoder
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u8,
    pcm: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(config: &AudioCodecConfig) -> Result<Self> {
        let decoder = Decoder::new(to_sample_rate(config.sample_rate)?, to_channels(config.channels))
            .map_err(|e| codec_error(format!("Failed to create Opus decoder: {:?}", e)))?;

        Ok(Self {
            decoder,
            sample_rate: config.sample_rate,
            channels: config.channels,
            pcm: vec![0i16; MAX_FRAME_SAMPLES * config.channels as usize],
        })
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<DecodedAudioFrame> {
        let per_channel = self
            .decoder
            .decode(Some(&chunk.payload[..]), &mut self.pcm[..], false)
            .map_err(|e| AppError::Internal(format!("Opus decode failed: {:?}", e)))?;

        let total = per_channel * self.channels as usize;
        Ok(DecodedAudioFrame {
            samples: self.pcm[..total].to_vec(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp_micros: chunk.timestamp_micros,
        })
    }
}
