//! Media encoding and decoding
//!
//! [`MediaPipeline`] owns the local encoders and one decoder pair per
//! remote participant. Codecs are created through a [`CodecFactory`] so the
//! native implementations can be swapped out.

pub mod codec;
mod h264;
mod opus;
mod pipeline;
mod sink;

pub use codec::{
    AudioDecoder, AudioEncoder, CodecFactory, DecodedAudioFrame, DecodedVideoFrame, RawAudioFrame,
    RawFrame, RawVideoFrame, VideoDecoder, VideoEncoder,
};
pub use h264::{H264Decoder, H264Encoder};
pub use opus::{OpusDecoder, OpusEncoder};
pub use pipeline::{MediaPipeline, PipelineStats};
pub use sink::OutputSink;

use crate::config::{AudioCodecConfig, VideoCodecConfig};
use crate::error::Result;

/// Codec factory backed by openh264 and libopus
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCodecFactory;

impl CodecFactory for NativeCodecFactory {
    fn video_encoder(&self, config: &VideoCodecConfig) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(H264Encoder::new(config)?))
    }

    fn video_decoder(&self, _config: &VideoCodecConfig) -> Result<Box<dyn VideoDecoder>> {
        Ok(Box::new(H264Decoder::new()?))
    }

    fn audio_encoder(&self, config: &AudioCodecConfig) -> Result<Box<dyn AudioEncoder>> {
        Ok(Box::new(OpusEncoder::new(config)?))
    }

    fn audio_decoder(&self, config: &AudioCodecConfig) -> Result<Box<dyn AudioDecoder>> {
        Ok(Box::new(OpusDecoder::new(config)?))
    }
}
