//! H.264 software codec (openh264)

use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType, RateControlMode};
use openh264::formats::{YUVBuffer, YUVSource};
use openh264::OpenH264API;
use tracing::{debug, info, trace};

use super::codec::{DecodedVideoFrame, RawVideoFrame, VideoDecoder, VideoEncoder};
use crate::config::VideoCodecConfig;
use crate::error::{AppError, Result};
use crate::protocol::{EncodedChunk, MediaKind};

fn codec_error(reason: String) -> AppError {
    AppError::CodecConfiguration {
        kind: MediaKind::Video,
        reason,
    }
}

/// Fixed encoder targets from the video configuration
fn encoder_config(config: &VideoCodecConfig) -> EncoderConfig {
    EncoderConfig::new()
        .bitrate(BitRate::from_bps(config.bitrate_bps))
        .max_frame_rate(FrameRate::from_hz(config.fps as f32))
        .rate_control_mode(RateControlMode::Bitrate)
}

/// H.264 encoder
///
/// Runs in bitrate rate-control mode at the configured bitrate and frame
/// rate. Frames must match the configured resolution.
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl H264Encoder {
    pub fn new(config: &VideoCodecConfig) -> Result<Self> {
        let encoder = Encoder::with_api_config(OpenH264API::from_source(), encoder_config(config))
            .map_err(|e| codec_error(format!("Failed to create H.264 encoder: {}", e)))?;

        info!(
            "H.264 encoder created: {}x{} @ {}fps, target {}bps",
            config.width, config.height, config.fps, config.bitrate_bps
        );

        Ok(Self {
            encoder,
            width: config.width,
            height: config.height,
            frame_count: 0,
        })
    }
}

impl VideoEncoder for H264Encoder {
    fn encode(&mut self, frame: &RawVideoFrame, force_keyframe: bool) -> Result<Option<EncodedChunk>> {
        if frame.width != self.width || frame.height != self.height {
            return Err(AppError::Internal(format!(
                "Frame size {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }
        let expected = RawVideoFrame::expected_len(frame.width, frame.height);
        if frame.i420.len() != expected {
            return Err(AppError::Internal(format!(
                "Invalid I420 frame: expected {} bytes, got {}",
                expected,
                frame.i420.len()
            )));
        }

        if force_keyframe {
            self.encoder.force_intra_frame();
        }

        let yuv = YUVBuffer::from_vec(frame.i420.to_vec(), frame.width as usize, frame.height as usize);
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| AppError::Internal(format!("H.264 encode failed: {}", e)))?;

        self.frame_count += 1;

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip) {
            trace!("H.264 encoder skipped frame {}", self.frame_count);
            return Ok(None);
        }

        let data = Bytes::from(bitstream.to_vec());
        let is_key = matches!(frame_type, FrameType::IDR | FrameType::I);
        trace!("Encoded frame {} ({} bytes, key={})", self.frame_count, data.len(), is_key);

        Ok(Some(if is_key {
            EncodedChunk::key(frame.timestamp_micros, data)
        } else {
            EncodedChunk::delta(frame.timestamp_micros, data)
        }))
    }

    fn name(&self) -> &str {
        "openh264"
    }
}

/// H.264 decoder producing RGB24 frames
pub struct H264Decoder {
    decoder: Decoder,
}

impl H264Decoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new()
            .map_err(|e| codec_error(format!("Failed to create H.264 decoder: {}", e)))?;
        debug!("H.264 decoder created");
        Ok(Self { decoder })
    }
}

impl VideoDecoder for H264Decoder {
    fn decode(&mut self, chunk: &EncodedChunk) -> Result<Option<DecodedVideoFrame>> {
        let decoded = self
            .decoder
            .decode(&chunk.payload)
            .map_err(|e| AppError::Internal(format!("H.264 decode failed: {}", e)))?;

        let Some(yuv) = decoded else {
            return Ok(None);
        };

        let (width, height) = yuv.dimensions();
        let mut rgb = vec![0u8; width * height * 3];
        yuv.write_rgb8(&mut rgb);

        Ok(Some(DecodedVideoFrame {
            width: width as u32,
            height: height as u32,
            rgb: Bytes::from(rgb),
            timestamp_micros: chunk.timestamp_micros,
        }))
    }
}
