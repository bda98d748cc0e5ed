//! Per-participant output sinks

use std::sync::Arc;
use tokio::sync::broadcast;

use super::codec::{DecodedAudioFrame, DecodedVideoFrame};

const VIDEO_SINK_CAPACITY: usize = 8;
const AUDIO_SINK_CAPACITY: usize = 32;

/// Decoded output of one remote participant
///
/// Renderers subscribe to the video and audio channels; frames with no
/// subscriber are dropped.
#[derive(Clone)]
pub struct OutputSink {
    participant: Arc<str>,
    video: broadcast::Sender<Arc<DecodedVideoFrame>>,
    audio: broadcast::Sender<Arc<DecodedAudioFrame>>,
}

impl OutputSink {
    pub fn new(participant: &str) -> Self {
        let (video, _) = broadcast::channel(VIDEO_SINK_CAPACITY);
        let (audio, _) = broadcast::channel(AUDIO_SINK_CAPACITY);
        Self {
            participant: Arc::from(participant),
            video,
            audio,
        }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn subscribe_video(&self) -> broadcast::Receiver<Arc<DecodedVideoFrame>> {
        self.video.subscribe()
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<Arc<DecodedAudioFrame>> {
        self.audio.subscribe()
    }

    pub(crate) fn push_video(&self, frame: DecodedVideoFrame) {
        let _ = self.video.send(Arc::new(frame));
    }

    pub(crate) fn push_audio(&self, frame: DecodedAudioFrame) {
        let _ = self.audio.send(Arc::new(frame));
    }
}
