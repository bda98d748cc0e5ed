//! Media pipeline
//!
//! # Architecture
//!
//! ```text
//! local capture --RawFrame--> encode_local --EncodedChunk--> transports
//!
//! transports --EncodedChunk--> decode_remote(participant)
//!                                   |
//!                                   v (per-participant decoders)
//!                              OutputSink (video / audio broadcast)
//! ```
//!
//! Video frames are encoded in submission order by one worker thread; audio
//! runs on the blocking thread pool. Each codec sits in a slot that is
//! filled on first use; a slot whose construction failed stays failed,
//! which disables that media kind without touching the other.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use super::codec::{
    AudioDecoder, AudioEncoder, CodecFactory, RawFrame, RawVideoFrame, VideoDecoder, VideoEncoder,
};
use super::sink::OutputSink;
use crate::config::{AudioCodecConfig, VideoCodecConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, RoomEvent};
use crate::protocol::{EncodedChunk, MediaKind};

/// Lazily constructed codec
enum CodecSlot<T: ?Sized> {
    Empty,
    Ready(Box<T>),
    Failed,
}

impl<T: ?Sized> CodecSlot<T> {
    /// Get the codec, constructing it on first use
    ///
    /// Returns `Ok(None)` once construction has failed before; only the
    /// first failure is returned as an error.
    fn get_or_init<F>(&mut self, kind: MediaKind, init: F) -> Result<Option<&mut Box<T>>>
    where
        F: FnOnce() -> Result<Box<T>>,
    {
        if let CodecSlot::Empty = self {
            match init() {
                Ok(codec) => *self = CodecSlot::Ready(codec),
                Err(e) => {
                    *self = CodecSlot::Failed;
                    return Err(match e {
                        err @ AppError::CodecConfiguration { .. } => err,
                        other => AppError::CodecConfiguration {
                            kind,
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }
        match self {
            CodecSlot::Ready(codec) => Ok(Some(codec)),
            _ => Ok(None),
        }
    }
}

type Slot<T> = Arc<Mutex<CodecSlot<T>>>;

fn empty_slot<T: ?Sized>() -> Slot<T> {
    Arc::new(Mutex::new(CodecSlot::Empty))
}

/// Decoders and sink of one remote participant
struct ParticipantMedia {
    sink: OutputSink,
    video_decoder: Slot<dyn VideoDecoder>,
    audio_decoder: Slot<dyn AudioDecoder>,
    /// Deltas are useless until a keyframe arrives
    awaiting_keyframe: AtomicBool,
    last_video_ts: Mutex<Option<u64>>,
}

impl ParticipantMedia {
    fn new(participant: &str) -> Self {
        Self {
            sink: OutputSink::new(participant),
            video_decoder: empty_slot(),
            audio_decoder: empty_slot(),
            awaiting_keyframe: AtomicBool::new(true),
            last_video_ts: Mutex::new(None),
        }
    }
}

/// Pipeline statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub video_encoded: u64,
    pub audio_encoded: u64,
    pub video_decoded: u64,
    pub audio_decoded: u64,
    /// Chunks dropped (keyframe gating, stale, codec errors)
    pub dropped: u64,
    pub keyframes_requested: u64,
    /// Kinds whose local encoder failed to configure
    pub degraded: Vec<MediaKind>,
    pub participants: usize,
}

/// One frame queued for the video encode worker
struct VideoJob {
    frame: RawVideoFrame,
    force_keyframe: bool,
    reply: oneshot::Sender<Result<Option<EncodedChunk>>>,
}

/// Encode frames in queue order until every sender is gone
fn video_encode_worker(
    jobs: std_mpsc::Receiver<VideoJob>,
    slot: Slot<dyn VideoEncoder>,
    factory: Arc<dyn CodecFactory>,
    config: VideoCodecConfig,
) {
    while let Ok(job) = jobs.recv() {
        let result = {
            let mut slot = slot.lock();
            match slot.get_or_init(MediaKind::Video, || factory.video_encoder(&config)) {
                Ok(Some(encoder)) => encoder.encode(&job.frame, job.force_keyframe),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            }
        };
        let _ = job.reply.send(result);
    }
    debug!("Video encode worker stopped");
}

/// Decrements the encode queue depth when dropped
struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Media pipeline
pub struct MediaPipeline {
    video_config: VideoCodecConfig,
    audio_config: AudioCodecConfig,
    factory: Arc<dyn CodecFactory>,
    events: EventBus,

    video_encoder: Slot<dyn VideoEncoder>,
    audio_encoder: Slot<dyn AudioEncoder>,
    /// Feeds the video encode worker; started on first use
    video_jobs: Mutex<Option<std_mpsc::Sender<VideoJob>>>,
    /// Video frames submitted whose chunk has not been handed back yet
    video_inflight: AtomicUsize,
    /// Last timestamp emitted per kind (video, audio)
    last_encoded_ts: Mutex<[Option<u64>; 2]>,
    video_enabled: AtomicBool,
    audio_enabled: AtomicBool,

    participants: RwLock<HashMap<String, Arc<ParticipantMedia>>>,
    disposed: AtomicBool,

    video_encoded: AtomicU64,
    audio_encoded: AtomicU64,
    video_decoded: AtomicU64,
    audio_decoded: AtomicU64,
    dropped: AtomicU64,
    keyframes_requested: AtomicU64,
    degraded: Mutex<Vec<MediaKind>>,
}

impl MediaPipeline {
    pub fn new(
        video_config: VideoCodecConfig,
        audio_config: AudioCodecConfig,
        factory: Arc<dyn CodecFactory>,
        events: EventBus,
    ) -> Self {
        Self {
            video_config,
            audio_config,
            factory,
            events,
            video_encoder: empty_slot(),
            audio_encoder: empty_slot(),
            video_jobs: Mutex::new(None),
            video_inflight: AtomicUsize::new(0),
            last_encoded_ts: Mutex::new([None, None]),
            video_enabled: AtomicBool::new(true),
            audio_enabled: AtomicBool::new(true),
            participants: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            video_encoded: AtomicU64::new(0),
            audio_encoded: AtomicU64::new(0),
            video_decoded: AtomicU64::new(0),
            audio_decoded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            keyframes_requested: AtomicU64::new(0),
            degraded: Mutex::new(Vec::new()),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AppError::InvalidState("media pipeline disposed".to_string()));
        }
        Ok(())
    }

    fn report_degraded(&self, err: &AppError) {
        if let AppError::CodecConfiguration { kind, reason } = err {
            warn!("{} codec unavailable, {} disabled: {}", kind, kind, reason);
            self.events.publish(RoomEvent::MediaDegraded {
                kind: *kind,
                reason: reason.clone(),
            });
        }
    }

    /// Enable or disable local production of one media kind
    pub fn set_kind_enabled(&self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Video => self.video_enabled.store(enabled, Ordering::SeqCst),
            MediaKind::Audio => self.audio_enabled.store(enabled, Ordering::SeqCst),
        }
        debug!("Local {} {}", kind, if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_kind_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video_enabled.load(Ordering::SeqCst),
            MediaKind::Audio => self.audio_enabled.load(Ordering::SeqCst),
        }
    }

    /// Clamp a timestamp so that output stays strictly increasing per kind
    fn monotonic_timestamp(&self, kind: MediaKind, ts: u64) -> u64 {
        let mut last = self.last_encoded_ts.lock();
        let slot = &mut last[match kind {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
        }];
        let ts = match *slot {
            Some(prev) if ts <= prev => prev.saturating_add(1),
            _ => ts,
        };
        *slot = Some(ts);
        ts
    }

    /// Queue a frame for the video encode worker, starting it if needed
    fn submit_video(&self, job: VideoJob) -> Result<()> {
        let mut jobs = self.video_jobs.lock();
        let job = match jobs.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return Ok(()),
                // worker gone; start a new one below
                Err(std_mpsc::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = std_mpsc::channel();
        let slot = self.video_encoder.clone();
        let factory = self.factory.clone();
        let config = self.video_config.clone();
        std::thread::Builder::new()
            .name("video-encode".to_string())
            .spawn(move || video_encode_worker(rx, slot, factory, config))
            .map_err(|e| AppError::Internal(format!("Failed to start video encode worker: {}", e)))?;
        debug!("Video encode worker started");

        tx.send(job)
            .map_err(|_| AppError::Internal("Video encode worker exited".to_string()))?;
        *jobs = Some(tx);
        Ok(())
    }

    /// Encode one local frame
    ///
    /// Video frames go through a single ordered queue. A keyframe is
    /// requested whenever the queue is empty at submission, so the first
    /// frame after an idle period is a keyframe while frames submitted
    /// with others still in flight are encoded as deltas. Returns `None`
    /// when the kind is disabled, degraded, or the encoder skipped the frame.
    pub async fn encode_local(&self, frame: RawFrame) -> Result<Option<EncodedChunk>> {
        self.ensure_live()?;
        let kind = frame.kind();
        if !self.is_kind_enabled(kind) {
            return Ok(None);
        }

        let result = match frame {
            RawFrame::Video(mut frame) => {
                let queued = self.video_inflight.fetch_add(1, Ordering::SeqCst);
                let _guard = InflightGuard(&self.video_inflight);
                let force_keyframe = queued == 0;
                if force_keyframe {
                    self.keyframes_requested.fetch_add(1, Ordering::Relaxed);
                }
                frame.timestamp_micros = self.monotonic_timestamp(kind, frame.timestamp_micros);

                let (reply, chunk) = oneshot::channel();
                self.submit_video(VideoJob {
                    frame,
                    force_keyframe,
                    reply,
                })?;
                chunk
                    .await
                    .map_err(|_| AppError::Internal("Video encode worker dropped a frame".to_string()))?
            }
            RawFrame::Audio(mut frame) => {
                frame.timestamp_micros = self.monotonic_timestamp(kind, frame.timestamp_micros);

                let slot = self.audio_encoder.clone();
                let factory = self.factory.clone();
                let config = self.audio_config.clone();
                tokio::task::spawn_blocking(move || {
                    let mut slot = slot.lock();
                    match slot.get_or_init(MediaKind::Audio, || factory.audio_encoder(&config))? {
                        Some(encoder) => encoder.encode(&frame).map(Some),
                        None => Ok(None),
                    }
                })
                .await
                .map_err(|e| AppError::Internal(format!("Audio encode task failed: {}", e)))?
            }
        };

        match result {
            Ok(Some(chunk)) => {
                let counter = match kind {
                    MediaKind::Video => &self.video_encoded,
                    MediaKind::Audio => &self.audio_encoded,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                trace!("Encoded {} chunk ts={} ({} bytes)", kind, chunk.timestamp_micros, chunk.payload.len());
                Ok(Some(chunk))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                if matches!(e, AppError::CodecConfiguration { .. }) {
                    self.degraded.lock().push(kind);
                    self.report_degraded(&e);
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// Decode one remote chunk into the participant's sink
    ///
    /// Chunks for unregistered participants are dropped. Video deltas are
    /// dropped until the first keyframe, and again after a decode error.
    pub async fn decode_remote(&self, participant: &str, kind: MediaKind, chunk: EncodedChunk) -> Result<()> {
        self.ensure_live()?;
        let Some(media) = self.participants.read().get(participant).cloned() else {
            debug!("Dropping {} chunk for unregistered participant {}", kind, participant);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        match kind {
            MediaKind::Video => self.decode_video(participant, &media, chunk).await,
            MediaKind::Audio => self.decode_audio(participant, &media, chunk).await,
        }
    }

    async fn decode_video(&self, participant: &str, media: &Arc<ParticipantMedia>, chunk: EncodedChunk) -> Result<()> {
        if !chunk.is_key() {
            if media.awaiting_keyframe.load(Ordering::SeqCst) {
                trace!("Dropping video delta from {} while awaiting keyframe", participant);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            let last = *media.last_video_ts.lock();
            if matches!(last, Some(prev) if chunk.timestamp_micros < prev) {
                trace!("Dropping stale video delta from {} ts={}", participant, chunk.timestamp_micros);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        *media.last_video_ts.lock() = Some(chunk.timestamp_micros);
        if chunk.is_key() {
            media.awaiting_keyframe.store(false, Ordering::SeqCst);
        }

        let slot = media.video_decoder.clone();
        let factory = self.factory.clone();
        let config = self.video_config.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock();
            match slot.get_or_init(MediaKind::Video, || factory.video_decoder(&config))? {
                Some(decoder) => decoder.decode(&chunk),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| AppError::Internal(format!("Video decode task failed: {}", e)))?;

        match result {
            Ok(Some(frame)) => {
                self.video_decoded.fetch_add(1, Ordering::Relaxed);
                media.sink.push_video(frame);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if matches!(e, AppError::CodecConfiguration { .. }) {
                    self.report_degraded(&e);
                } else {
                    media.awaiting_keyframe.store(true, Ordering::SeqCst);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    async fn decode_audio(&self, participant: &str, media: &Arc<ParticipantMedia>, chunk: EncodedChunk) -> Result<()> {
        let slot = media.audio_decoder.clone();
        let factory = self.factory.clone();
        let config = self.audio_config.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock();
            match slot.get_or_init(MediaKind::Audio, || factory.audio_decoder(&config))? {
                Some(decoder) => decoder.decode(&chunk).map(Some),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| AppError::Internal(format!("Audio decode task failed: {}", e)))?;

        match result {
            Ok(Some(frame)) => {
                self.audio_decoded.fetch_add(1, Ordering::Relaxed);
                media.sink.push_audio(frame);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if matches!(e, AppError::CodecConfiguration { .. }) {
                    self.report_degraded(&e);
                } else {
                    trace!("Audio decode failed for {}: {}", participant, e);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// Register a remote participant and return its output sink
    ///
    /// Registering twice returns the existing sink.
    pub fn register_participant(&self, participant: &str) -> OutputSink {
        let mut participants = self.participants.write();
        participants
            .entry(participant.to_string())
            .or_insert_with(|| {
                debug!("Registered media sink for {}", participant);
                Arc::new(ParticipantMedia::new(participant))
            })
            .sink
            .clone()
    }

    /// Release a participant's decoders and sink (idempotent)
    pub fn release_participant(&self, participant: &str) {
        if self.participants.write().remove(participant).is_some() {
            debug!("Released media for {}", participant);
        }
    }

    pub fn sink(&self, participant: &str) -> Option<OutputSink> {
        self.participants.read().get(participant).map(|m| m.sink.clone())
    }

    /// Release every codec and sink
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.participants.write().clear();
        // dropping the sender stops the encode worker
        self.video_jobs.lock().take();
        *self.video_encoder.lock() = CodecSlot::Empty;
        *self.audio_encoder.lock() = CodecSlot::Empty;
        info!("Media pipeline disposed");
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            video_encoded: self.video_encoded.load(Ordering::Relaxed),
            audio_encoded: self.audio_encoded.load(Ordering::Relaxed),
            video_decoded: self.video_decoded.load(Ordering::Relaxed),
            audio_decoded: self.audio_decoded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            keyframes_requested: self.keyframes_requested.load(Ordering::Relaxed),
            degraded: self.degraded.lock().clone(),
            participants: self.participants.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::codec::{RawAudioFrame, RawVideoFrame};
    use crate::testing::RecordingCodecFactory;
    use bytes::Bytes;

    fn pipeline(factory: RecordingCodecFactory) -> (MediaPipeline, EventBus) {
        let events = EventBus::new();
        let pipeline = MediaPipeline::new(
            VideoCodecConfig::default(),
            AudioCodecConfig::default(),
            Arc::new(factory),
            events.clone(),
        );
        (pipeline, events)
    }

    fn video(ts: u64) -> RawFrame {
        RawFrame::Video(RawVideoFrame {
            width: 2,
            height: 2,
            i420: Bytes::from_static(&[1, 2, 3, 4, 5, 6]),
            timestamp_micros: ts,
        })
    }

    fn audio(ts: u64) -> RawFrame {
        RawFrame::Audio(RawAudioFrame {
            samples: vec![0; 4],
            timestamp_micros: ts,
        })
    }

    #[tokio::test]
    async fn test_idle_encoder_requests_keyframe() {
        let (pipeline, _) = pipeline(RecordingCodecFactory::new());

        let first = pipeline.encode_local(video(0)).await.unwrap().unwrap();
        assert!(first.is_key());

        // queue drained again, so the next frame heals with a keyframe
        let second = pipeline.encode_local(video(33_333)).await.unwrap().unwrap();
        assert!(second.is_key());
        assert_eq!(pipeline.stats().keyframes_requested, 2);
    }

    #[tokio::test]
    async fn test_frames_in_flight_encode_as_deltas() {
        let (pipeline, _) = pipeline(RecordingCodecFactory::new());

        let (a, b, c) = tokio::join!(
            pipeline.encode_local(video(0)),
            pipeline.encode_local(video(33_333)),
            pipeline.encode_local(video(66_666)),
        );
        let (a, b, c) = (a.unwrap().unwrap(), b.unwrap().unwrap(), c.unwrap().unwrap());

        assert!(a.is_key());
        assert!(!b.is_key());
        assert!(!c.is_key());
        // queue order is encode order
        assert_eq!(
            [a.timestamp_micros, b.timestamp_micros, c.timestamp_micros],
            [0, 33_333, 66_666]
        );
        assert_eq!(pipeline.stats().keyframes_requested, 1);
        assert_eq!(pipeline.stats().video_encoded, 3);

        let next = pipeline.encode_local(video(100_000)).await.unwrap().unwrap();
        assert!(next.is_key());
    }

    #[tokio::test]
    async fn test_timestamp_clamp_saturates() {
        let (pipeline, _) = pipeline(RecordingCodecFactory::new());

        let a = pipeline.encode_local(audio(u64::MAX)).await.unwrap().unwrap();
        let b = pipeline.encode_local(audio(5)).await.unwrap().unwrap();
        assert_eq!(a.timestamp_micros, u64::MAX);
        assert_eq!(b.timestamp_micros, u64::MAX);
    }

    #[tokio::test]
    async fn test_timestamps_stay_monotonic() {
        let (pipeline, _) = pipeline(RecordingCodecFactory::new());

        let a = pipeline.encode_local(audio(1000)).await.unwrap().unwrap();
        let b = pipeline.encode_local(audio(1000)).await.unwrap().unwrap();
        let c = pipeline.encode_local(audio(500)).await.unwrap().unwrap();
        assert_eq!(a.timestamp_micros, 1000);
        assert_eq!(b.timestamp_micros, 1001);
        assert_eq!(c.timestamp_micros, 1002);

        // video has its own clock
        let v = pipeline.encode_local(video(10)).await.unwrap().unwrap();
        assert_eq!(v.timestamp_micros, 10);
    }

    #[tokio::test]
    async fn test_disabled_kind_produces_nothing() {
        let (pipeline, _) = pipeline(RecordingCodecFactory::new());
        pipeline.set_kind_enabled(MediaKind::Audio, false);
        assert!(pipeline.encode_local(audio(0)).await.unwrap().is_none());
        assert!(pipeline.encode_local(video(0)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_encoder_failure_degrades_one_kind() {
        let factory = RecordingCodecFactory::new().fail_kind(MediaKind::Video);
        let (pipeline, events) = pipeline(factory);
        let mut rx = events.subscribe();

        let err = pipeline.encode_local(video(0)).await.unwrap_err();
        assert!(matches!(err, AppError::CodecConfiguration { kind: MediaKind::Video, .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            RoomEvent::MediaDegraded { kind: MediaKind::Video, .. }
        ));

        // reported once, then silently skipped
        assert!(pipeline.encode_local(video(1)).await.unwrap().is_none());
        assert!(pipeline.encode_local(audio(0)).await.unwrap().is_some());
        assert_eq!(pipeline.stats().degraded, vec![MediaKind::Video]);
    }

    #[tokio::test]
    async fn test_decode_routes_to_participant_sink() {
        let factory = RecordingCodecFactory::new();
        let decodes = factory.decode_calls();
        let (pipeline, _) = pipeline(factory);

        let sink_a = pipeline.register_participant("a");
        let sink_b = pipeline.register_participant("b");
        let mut rx_a = sink_a.subscribe_video();
        let mut rx_b = sink_b.subscribe_video();

        pipeline
            .decode_remote("a", MediaKind::Video, EncodedChunk::key(1000, vec![7u8; 500]))
            .await
            .unwrap();

        let frame = rx_a.recv().await.unwrap();
        assert_eq!(frame.timestamp_micros, 1000);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deltas_wait_for_keyframe() {
        let factory = RecordingCodecFactory::new();
        let decodes = factory.decode_calls();
        let (pipeline, _) = pipeline(factory);
        pipeline.register_participant("a");

        pipeline
            .decode_remote("a", MediaKind::Video, EncodedChunk::delta(10, vec![1]))
            .await
            .unwrap();
        assert_eq!(decodes.load(Ordering::SeqCst), 0);

        pipeline
            .decode_remote("a", MediaKind::Video, EncodedChunk::key(20, vec![1]))
            .await
            .unwrap();
        pipeline
            .decode_remote("a", MediaKind::Video, EncodedChunk::delta(30, vec![1]))
            .await
            .unwrap();
        // stale delta
        pipeline
            .decode_remote("a", MediaKind::Video, EncodedChunk::delta(25, vec![1]))
            .await
            .unwrap();

        assert_eq!(decodes.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.stats().dropped, 2);
    }

    #[tokio::test]
    async fn test_unregistered_participant_dropped() {
        let factory = RecordingCodecFactory::new();
        let decodes = factory.decode_calls();
        let (pipeline, _) = pipeline(factory);

        pipeline
            .decode_remote("ghost", MediaKind::Audio, EncodedChunk::key(0, vec![1]))
            .await
            .unwrap();
        assert_eq!(decodes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_register_release_idempotent() {
        let (pipeline, _) = pipeline(RecordingCodecFactory::new());
        let first = pipeline.register_participant("a");
        let second = pipeline.register_participant("a");
        assert_eq!(first.participant(), second.participant());
        assert_eq!(pipeline.stats().participants, 1);

        pipeline.release_participant("a");
        pipeline.release_participant("a");
        assert!(pipeline.sink("a").is_none());
    }

    #[tokio::test]
    async fn test_dispose() {
        let (pipeline, _) = pipeline(RecordingCodecFactory::new());
        pipeline.register_participant("a");
        pipeline.dispose();
        pipeline.dispose();

        assert_eq!(pipeline.stats().participants, 0);
        assert!(matches!(
            pipeline.encode_local(audio(0)).await,
            Err(AppError::InvalidState(_))
        ));
    }
}
