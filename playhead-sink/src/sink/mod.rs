//! The device writer
//!
//! [`AudioSink`] owns the device lifecycle: it computes output
//! configurations, lazily opens the device on first data, feeds the
//! processing pipeline, performs non-blocking backpressured writes, drains
//! at end of stream, and maps device positions back to media time across
//! speed/pitch/silence-skip changes.
//!
//! Stream lifecycle: `Idle → Configured → DeviceOpen → (Playing ⇄ Paused) →
//! Draining → Idle`. One thread owns all calls; see the crate docs for the
//! concurrency model.

pub mod config;
pub mod media_time;
pub mod release;

pub use config::{
    CapabilityProber, Configuration, ModeSupport, OutputMode, PcmOnlyProber, StreamFormat,
};
pub use media_time::{CheckpointQueue, MediaPositionCheckpoint, SkippedSilenceTracker};
pub use release::ReleasePool;

use crate::clock::PositionTracker;
use crate::device::{
    DeviceError, DeviceProvider, MonotonicClock, OutputDevice, PlayState, SinkClock, WriteData,
};
use crate::error::{Result, SinkError};
use crate::events::{self, SinkEvent, SinkListener};
use crate::pipeline::{
    channel_map::ChannelMapProcessor, resample::ResampleProcessor,
    silence_skip::SilenceSkipProcessor, tempo::TempoProcessor, trim::TrimProcessor, convert,
    Pipeline,
};
use playhead_common::{PlaybackParams, SinkTuning};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default device buffer for encoded (offload/passthrough) output
const DEFAULT_ENCODED_BUFFER_BYTES: usize = 128 * 1024;

/// Tracks a failure class that is retried until a deadline: the first
/// failure starts the clock, recurring failures within the window are
/// swallowed, and the error is finally surfaced if the condition persists.
struct PendingErrorHolder {
    delay_ms: i64,
    deadline_ms: Option<i64>,
    pending: Option<SinkError>,
}

impl PendingErrorHolder {
    fn new(delay_ms: i64) -> Self {
        Self {
            delay_ms,
            deadline_ms: None,
            pending: None,
        }
    }

    fn submit(&mut self, error: SinkError, now_ms: i64) -> Result<()> {
        let deadline = *self.deadline_ms.get_or_insert(now_ms + self.delay_ms);
        self.pending = Some(error);
        if now_ms >= deadline {
            self.deadline_ms = None;
            if let Some(error) = self.pending.take() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.pending = None;
        self.deadline_ms = None;
    }
}

/// The current input chunk, held until the device has taken all of it.
struct PendingInput {
    data: PendingData,
    presentation_time_us: i64,
    unit_count: u32,
    source_len: usize,
}

enum PendingData {
    /// Converted PCM destined for the pipeline; queued once, then drained
    /// from the pipeline's output
    Pipeline { samples: Vec<f32>, queued: bool },
    /// Converted PCM written straight to the device (no active stages)
    Direct { samples: Vec<f32>, consumed: usize },
    /// Encoded access units forwarded to the device
    Encoded { bytes: Vec<u8>, consumed: usize },
}

impl PendingData {
    fn fully_consumed(&self) -> bool {
        match self {
            PendingData::Pipeline { queued, .. } => *queued,
            PendingData::Direct { samples, consumed } => *consumed >= samples.len(),
            PendingData::Encoded { bytes, consumed } => *consumed >= bytes.len(),
        }
    }
}

/// Builder for [`AudioSink`].
pub struct SinkBuilder {
    provider: Box<dyn DeviceProvider>,
    prober: Box<dyn CapabilityProber>,
    clock: Arc<dyn SinkClock>,
    tuning: SinkTuning,
    release_pool: ReleasePool,
    prefer_platform_speed: bool,
}

impl SinkBuilder {
    pub fn new(provider: Box<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            prober: Box::new(PcmOnlyProber),
            clock: Arc::new(MonotonicClock::new()),
            tuning: SinkTuning::default(),
            release_pool: ReleasePool::new(),
            prefer_platform_speed: false,
        }
    }

    /// Use a custom capability collaborator (enables offload/passthrough)
    pub fn prober(mut self, prober: Box<dyn CapabilityProber>) -> Self {
        self.prober = prober;
        self
    }

    /// Use a custom time source (tests)
    pub fn clock(mut self, clock: Arc<dyn SinkClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tuning(mut self, tuning: SinkTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Share a release pool between sinks
    pub fn release_pool(mut self, pool: ReleasePool) -> Self {
        self.release_pool = pool;
        self
    }

    /// Prefer applying speed/pitch in the device over the software pipeline
    pub fn prefer_platform_speed(mut self, prefer: bool) -> Self {
        self.prefer_platform_speed = prefer;
        self
    }

    pub fn build(self) -> AudioSink {
        let pipeline = Pipeline::new(vec![
            Box::new(ChannelMapProcessor::new()),
            Box::new(TrimProcessor::new()),
            Box::new(SilenceSkipProcessor::new()),
            Box::new(TempoProcessor::new()),
            Box::new(ResampleProcessor::new(0)),
        ]);
        let tracker = PositionTracker::new(self.tuning.clone(), Arc::clone(&self.clock));
        let (released_tx, released_rx) = channel();
        let retry_ms = self.tuning.retry_deadline_ms;
        AudioSink {
            tuning: self.tuning,
            clock: self.clock,
            provider: self.provider,
            prober: self.prober,
            listener: None,
            release_pool: self.release_pool,
            releasing: Arc::new(AtomicBool::new(false)),
            released_tx,
            released_rx,
            tracker,
            pipeline,
            configuration: None,
            pending_configuration: None,
            device: None,
            playing: false,
            prefer_platform_speed: self.prefer_platform_speed,
            offload_requested: false,
            tunneling: false,
            playback_params: PlaybackParams::default(),
            skip_silence_enabled: false,
            checkpoints: CheckpointQueue::new(),
            silence: SkippedSilenceTracker::new(),
            after_drain_params: None,
            submitted_input_frames: 0,
            submitted_encoded_frames: 0,
            written_pcm_samples: 0,
            written_encoded_frames: 0,
            start_media_time_us: 0,
            start_media_time_needs_sync: false,
            start_media_time_needs_init: false,
            input_pending: None,
            handled_end_of_stream: false,
            stopped_device: false,
            offload_disabled_until_next_configure: false,
            last_feed_time_ms: 0,
            last_feed_pts_us: 0,
            init_error_holder: PendingErrorHolder::new(retry_ms),
            write_error_holder: PendingErrorHolder::new(retry_ms),
            pending_events: Vec::new(),
            volume: 1.0,
        }
    }
}

/// Buffered, backpressure-aware audio sink with an accurate playback clock.
pub struct AudioSink {
    tuning: SinkTuning,
    clock: Arc<dyn SinkClock>,
    provider: Box<dyn DeviceProvider>,
    prober: Box<dyn CapabilityProber>,
    listener: Option<Box<dyn SinkListener>>,

    release_pool: ReleasePool,
    releasing: Arc<AtomicBool>,
    released_tx: Sender<()>,
    released_rx: Receiver<()>,

    tracker: PositionTracker,
    pipeline: Pipeline,

    configuration: Option<Configuration>,
    pending_configuration: Option<Configuration>,
    device: Option<Box<dyn OutputDevice>>,

    playing: bool,
    prefer_platform_speed: bool,
    offload_requested: bool,
    tunneling: bool,
    playback_params: PlaybackParams,
    skip_silence_enabled: bool,

    checkpoints: CheckpointQueue,
    silence: SkippedSilenceTracker,
    after_drain_params: Option<PlaybackParams>,

    submitted_input_frames: u64,
    submitted_encoded_frames: u64,
    written_pcm_samples: u64,
    written_encoded_frames: u64,

    start_media_time_us: i64,
    start_media_time_needs_sync: bool,
    start_media_time_needs_init: bool,

    input_pending: Option<PendingInput>,
    handled_end_of_stream: bool,
    stopped_device: bool,
    offload_disabled_until_next_configure: bool,
    last_feed_time_ms: i64,
    last_feed_pts_us: i64,

    init_error_holder: PendingErrorHolder,
    write_error_holder: PendingErrorHolder,
    pending_events: Vec<SinkEvent>,
    volume: f32,
}

impl AudioSink {
    pub fn builder(provider: Box<dyn DeviceProvider>) -> SinkBuilder {
        SinkBuilder::new(provider)
    }

    /// Set the listener receiving sink events
    pub fn set_listener(&mut self, listener: Box<dyn SinkListener>) {
        self.listener = Some(listener);
    }

    /// Request offload output for subsequent configurations (subject to the
    /// capability collaborator agreeing)
    pub fn set_offload_enabled(&mut self, enabled: bool) {
        self.offload_requested = enabled;
    }

    /// Whether [`configure`](Self::configure) would find an output path for
    /// the given stream format
    pub fn supports_format(&self, format: &StreamFormat) -> bool {
        if format.audio.encoding.is_pcm() {
            !matches!(
                self.prober.probe(format, false),
                ModeSupport::Unsupported
            )
        } else {
            matches!(
                self.prober.probe(format, self.offload_requested),
                ModeSupport::Passthrough { .. } | ModeSupport::Offload { .. }
            )
        }
    }

    /// Enable AV-sync tunneling. Forces a flush when the flag changes while
    /// a device is open.
    pub fn set_tunneling_enabled(&mut self, enabled: bool) {
        if self.tunneling != enabled {
            self.tunneling = enabled;
            self.flush();
        }
    }

    /// Compute the output configuration for a new stream format. Applied
    /// immediately when no device is open, otherwise stored as pending and
    /// applied once the current stream has drained.
    pub fn configure(
        &mut self,
        format: StreamFormat,
        output_channels: Option<Vec<usize>>,
        specified_buffer_size: Option<usize>,
    ) -> Result<()> {
        let configuration = if format.audio.encoding.is_pcm() {
            self.configure_pcm(format, output_channels, specified_buffer_size)?
        } else {
            self.configure_compressed(format, specified_buffer_size)?
        };
        self.offload_disabled_until_next_configure = false;

        debug!(mode = ?configuration.output_mode, format = ?configuration.output_format,
               "sink configured");
        if self.device.is_some() {
            self.pending_configuration = Some(configuration);
        } else {
            self.configuration = Some(configuration);
        }
        Ok(())
    }

    fn configure_pcm(
        &mut self,
        format: StreamFormat,
        output_channels: Option<Vec<usize>>,
        specified_buffer_size: Option<usize>,
    ) -> Result<Configuration> {
        let support = self.prober.probe(&format, false);
        let preferred_rate = match support {
            ModeSupport::Pcm {
                preferred_sample_rate,
            } => preferred_sample_rate,
            ModeSupport::Unsupported => {
                return Err(SinkError::Configuration {
                    format: format.audio,
                    reason: "PCM output not supported".into(),
                })
            }
            // Compressed modes never apply to PCM input
            _ => None,
        };

        self.pipeline.set_channel_map(output_channels);
        self.pipeline
            .set_trim_frames(format.encoder_delay, format.encoder_padding);
        self.pipeline
            .set_output_rate(preferred_rate.unwrap_or(format.audio.sample_rate));
        self.pipeline
            .set_playback_params(self.software_params_for(&format));
        self.pipeline.set_skip_silence(self.skip_silence_enabled);

        let pipeline_input =
            config::pcm_output_format(format.audio.sample_rate, format.audio.channels);
        let output_format = self.pipeline.configure(&pipeline_input)?;

        let buffer_size_bytes = specified_buffer_size
            .unwrap_or_else(|| Configuration::default_pcm_buffer_size_bytes(&output_format));
        Ok(Configuration {
            input_format: format,
            output_mode: OutputMode::Pcm,
            output_format,
            buffer_size_bytes,
            frames_per_encoded_unit: 0,
            enable_platform_speed: self.prefer_platform_speed,
            tunneling: self.tunneling,
        })
    }

    fn configure_compressed(
        &mut self,
        format: StreamFormat,
        specified_buffer_size: Option<usize>,
    ) -> Result<Configuration> {
        let offload_allowed = self.offload_requested && !self.offload_disabled_until_next_configure;
        let support = self.prober.probe(&format, offload_allowed);
        let buffer_size_bytes = specified_buffer_size.unwrap_or(DEFAULT_ENCODED_BUFFER_BYTES);
        let frames_per_encoded_unit = Configuration::encoded_unit_frames(&format.audio.encoding);

        match support {
            ModeSupport::Offload { gapless } if offload_allowed => {
                debug!(gapless, "using offload output");
                Ok(Configuration {
                    input_format: format,
                    output_mode: OutputMode::Offload,
                    output_format: format.audio,
                    buffer_size_bytes,
                    frames_per_encoded_unit,
                    // Offload needs device playback params for quick speed
                    // changes
                    enable_platform_speed: true,
                    tunneling: self.tunneling,
                })
            }
            ModeSupport::Passthrough { channels } => Ok(Configuration {
                input_format: format,
                output_mode: OutputMode::Passthrough,
                output_format: config::compressed_output_format(&format.audio, Some(channels)),
                buffer_size_bytes,
                frames_per_encoded_unit,
                enable_platform_speed: self.prefer_platform_speed,
                tunneling: self.tunneling,
            }),
            _ => Err(SinkError::Configuration {
                format: format.audio,
                reason: "no output path for compressed stream".into(),
            }),
        }
    }

    /// Feed a chunk of audio. Returns `Ok(true)` when the chunk has been
    /// fully accepted; `Ok(false)` is backpressure and the caller must
    /// retry the same chunk.
    pub fn handle_buffer(
        &mut self,
        buffer: &[u8],
        presentation_time_us: i64,
        encoded_unit_count: u32,
    ) -> Result<bool> {
        let result = self.handle_buffer_inner(buffer, presentation_time_us, encoded_unit_count);
        self.dispatch_events();
        result
    }

    fn handle_buffer_inner(
        &mut self,
        buffer: &[u8],
        presentation_time_us: i64,
        encoded_unit_count: u32,
    ) -> Result<bool> {
        if let Some(pending) = &self.input_pending {
            debug_assert_eq!(pending.source_len, buffer.len());
            debug_assert_eq!(pending.presentation_time_us, presentation_time_us);
        }

        if self.pending_configuration.is_some() {
            if !self.drain_to_end_of_stream()? {
                // Still pending data in the pipeline to write out.
                return Ok(false);
            }
            let compatible = match (&self.pending_configuration, &self.configuration) {
                (Some(pending), Some(current)) => current.can_reuse_device(pending),
                _ => false,
            };
            if !compatible {
                self.play_pending_data();
                if self.has_pending_data() {
                    // Waiting for playout on the current device to finish.
                    return Ok(false);
                }
                self.flush();
            } else {
                // The open device can be reused for the new configuration.
                self.configuration = self.pending_configuration.take();
                let is_offload = matches!(
                    &self.configuration,
                    Some(c) if c.output_mode == OutputMode::Offload
                );
                if let Some(device) = self.device.as_mut() {
                    if is_offload && device.play_state() == PlayState::Playing {
                        // The counter restarts at the track boundary; treat
                        // the drop as intentional, not as a wrap.
                        device.notify_stream_transition();
                        self.tracker.expect_raw_position_reset();
                    }
                }
            }
            // Re-apply playback parameters for the new stream.
            self.apply_playback_params_and_skip_silence(presentation_time_us);
        }

        if self.device.is_none() {
            match self.ensure_device() {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    if e.is_recoverable() {
                        return Err(e);
                    }
                    let now_ms = self.clock.now_ms();
                    self.init_error_holder.submit(e, now_ms)?;
                    return Ok(false);
                }
            }
        }
        self.init_error_holder.clear();

        if self.start_media_time_needs_init {
            self.start_media_time_us = presentation_time_us.max(0);
            self.start_media_time_needs_sync = false;
            self.start_media_time_needs_init = false;

            if self.use_platform_speed() {
                self.apply_device_playback_rate();
            }
            self.apply_playback_params_and_skip_silence(presentation_time_us);

            if self.playing {
                self.play();
            }
        }

        let written_frames = self.written_frames();
        let may_write = match self.device.as_mut() {
            Some(device) => self.tracker.may_handle_buffer(device.as_mut(), written_frames),
            None => false,
        };
        if !may_write {
            return Ok(false);
        }

        if self.input_pending.is_none() {
            if buffer.is_empty() {
                return Ok(true);
            }

            if self.after_drain_params.is_some() {
                if !self.drain_to_end_of_stream()? {
                    // Don't process more input until draining completes.
                    return Ok(false);
                }
                self.apply_playback_params_and_skip_silence(presentation_time_us);
                self.after_drain_params = None;
            }

            // Check that the presentation time is consistent with the frames
            // submitted so far.
            let (expected_time_us, output_mode, input_frame_bytes, frames_per_unit) = {
                let config = match &self.configuration {
                    Some(config) => config,
                    None => {
                        return Err(SinkError::InvalidState(
                            "handle_buffer before configure".into(),
                        ))
                    }
                };
                let net_submitted = self
                    .submitted_frames()
                    .saturating_sub(self.pipeline.trimmed_input_frames());
                (
                    self.start_media_time_us + config.input_frames_to_duration_us(net_submitted),
                    config.output_mode,
                    config.input_frame_bytes(),
                    config.frames_per_encoded_unit,
                )
            };
            if !self.start_media_time_needs_sync
                && (presentation_time_us - expected_time_us).abs()
                    > self.tuning.discontinuity_threshold_us
            {
                warn!(
                    presentation_time_us,
                    expected_time_us, "unexpected presentation time; resynchronizing"
                );
                self.pending_events.push(SinkEvent::RecoverableError {
                    description: format!(
                        "presentation time {presentation_time_us}us diverged from expected {expected_time_us}us"
                    ),
                });
                self.start_media_time_needs_sync = true;
            }
            if self.start_media_time_needs_sync {
                if !self.drain_to_end_of_stream()? {
                    // Timing can't move until pending stage buffers drain.
                    return Ok(false);
                }
                let adjustment_us = presentation_time_us - expected_time_us;
                self.start_media_time_us += adjustment_us;
                self.start_media_time_needs_sync = false;
                self.apply_playback_params_and_skip_silence(presentation_time_us);
                if adjustment_us != 0 {
                    self.pending_events.push(SinkEvent::PositionDiscontinuity);
                }
            }

            match output_mode {
                OutputMode::Pcm => {
                    self.submitted_input_frames += (buffer.len() / input_frame_bytes) as u64;
                    let sample_format = match &self.configuration {
                        Some(config) => match config.input_format.audio.encoding {
                            playhead_common::Encoding::Pcm(fmt) => fmt,
                            _ => playhead_common::SampleFormat::F32,
                        },
                        None => playhead_common::SampleFormat::F32,
                    };
                    let mut samples = Vec::with_capacity(buffer.len() / 2);
                    convert::pcm_to_f32(sample_format, buffer, &mut samples);
                    let data = if self.pipeline.is_operational() {
                        PendingData::Pipeline {
                            samples,
                            queued: false,
                        }
                    } else {
                        PendingData::Direct {
                            samples,
                            consumed: 0,
                        }
                    };
                    self.input_pending = Some(PendingInput {
                        data,
                        presentation_time_us,
                        unit_count: encoded_unit_count,
                        source_len: buffer.len(),
                    });
                }
                OutputMode::Offload | OutputMode::Passthrough => {
                    self.submitted_encoded_frames +=
                        frames_per_unit as u64 * encoded_unit_count as u64;
                    self.input_pending = Some(PendingInput {
                        data: PendingData::Encoded {
                            bytes: buffer.to_vec(),
                            consumed: 0,
                        },
                        presentation_time_us,
                        unit_count: encoded_unit_count,
                        source_len: buffer.len(),
                    });
                }
            }
            self.last_feed_pts_us = presentation_time_us;
        }

        self.process_buffers(presentation_time_us)?;

        let fully_consumed = self
            .input_pending
            .as_ref()
            .map_or(true, |pending| pending.data.fully_consumed());
        if fully_consumed {
            self.input_pending = None;
            return Ok(true);
        }

        let written_frames = self.written_frames();
        if self.tracker.is_stalled(written_frames) {
            warn!("resetting stalled device");
            self.flush();
            return Ok(true);
        }

        Ok(false)
    }

    /// Start (or resume) playback.
    pub fn play(&mut self) {
        self.playing = true;
        if let Some(device) = self.device.as_mut() {
            self.tracker.start();
            device.play();
        }
    }

    /// Pause playback, retaining buffered audio.
    pub fn pause(&mut self) {
        self.playing = false;
        if let Some(device) = self.device.as_mut() {
            let needs_device_pause = self.tracker.pause(device.as_mut());
            let is_offload = matches!(
                &self.configuration,
                Some(c) if c.output_mode == OutputMode::Offload
            );
            if needs_device_pause || is_offload {
                device.pause();
            }
        }
        self.dispatch_events();
    }

    /// Note that the next buffer is discontinuous with the previous one
    /// (seek); the start time will resynchronize without being reported as
    /// unexpected.
    pub fn handle_discontinuity(&mut self) {
        self.start_media_time_needs_sync = true;
    }

    /// Drain the pipeline and stop the device once everything written has
    /// actually played out.
    pub fn play_to_end_of_stream(&mut self) -> Result<()> {
        let result = (|| {
            if !self.handled_end_of_stream
                && self.device.is_some()
                && self.drain_to_end_of_stream()?
            {
                self.play_pending_data();
                self.handled_end_of_stream = true;
            }
            Ok(())
        })();
        self.dispatch_events();
        result
    }

    /// Whether the sink has played everything it will ever play
    pub fn is_ended(&mut self) -> bool {
        self.device.is_none() || (self.handled_end_of_stream && !self.has_pending_data())
    }

    /// Whether the device still holds unplayed audio
    pub fn has_pending_data(&mut self) -> bool {
        let written_frames = self.written_frames();
        let pending = match self.device.as_mut() {
            Some(device) => self.tracker.has_pending_data(device.as_mut(), written_frames),
            None => false,
        };
        pending
    }

    /// Current media position in microseconds, or `None` before the first
    /// device open.
    pub fn current_position_us(&mut self, source_ended: bool) -> Option<i64> {
        if self.device.is_none() || self.configuration.is_none() || self.start_media_time_needs_init
        {
            self.dispatch_events();
            return None;
        }

        let written_frames = self.written_frames();
        let device_position_cap_us = match &self.configuration {
            Some(config) => config.frames_to_duration_us(written_frames),
            None => 0,
        };
        let mut position_us = match self.device.as_mut() {
            Some(device) => self.tracker.current_position_us(device.as_mut(), source_ended),
            None => 0,
        };
        // Never report beyond what has been written.
        position_us = position_us.min(device_position_cap_us);

        // Device time → media time across speed/pitch checkpoints.
        let pipeline = &self.pipeline;
        let media_time_us = self
            .checkpoints
            .media_time_for_position(position_us, |playout_us| {
                pipeline.media_duration_for_output(playout_us)
            });

        // Add back audio elided by silence skipping, batching the reports.
        let now_ms = self.clock.now_ms();
        let skipped_frames = self.pipeline.skipped_output_frames();
        let skipped_adjustment_us = match &self.configuration {
            Some(config) => self.silence.observe(
                skipped_frames,
                |frames| config.frames_to_duration_us(frames),
                now_ms,
                self.tuning.silence_report_debounce_ms,
            ),
            None => 0,
        };
        if let Some(duration_us) = self
            .silence
            .take_report(now_ms, self.tuning.min_reported_silence_us)
        {
            self.pending_events
                .push(SinkEvent::SilenceSkipped { duration_us });
        }

        self.dispatch_events();
        Some(media_time_us + skipped_adjustment_us)
    }

    /// Set playback speed and pitch. Values outside [0.1, 8.0] are clamped.
    pub fn set_playback_parameters(&mut self, params: PlaybackParams) {
        self.playback_params = PlaybackParams::new(params.speed, params.pitch);
        if self.use_platform_speed() {
            self.apply_device_playback_rate();
        } else {
            self.stage_software_params();
        }
    }

    pub fn playback_parameters(&self) -> PlaybackParams {
        self.playback_params
    }

    /// Enable or disable silence skipping. Takes effect after the pipeline
    /// drains to the change point.
    pub fn set_skip_silence_enabled(&mut self, enabled: bool) {
        self.skip_silence_enabled = enabled;
        // Applied together with the playback parameters after a drain.
        self.stage_software_params();
    }

    pub fn skip_silence_enabled(&self) -> bool {
        self.skip_silence_enabled
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(device) = self.device.as_mut() {
            device.set_volume(volume);
        }
    }

    /// Discard buffered audio and release the device asynchronously. Safe
    /// and idempotent at any point, including mid-write.
    pub fn flush(&mut self) {
        if self.device.is_some() {
            self.reset_for_flush();

            if let Some(mut device) = self.device.take() {
                if device.play_state() == PlayState::Playing {
                    device.pause();
                }
                if let Some(pending) = self.pending_configuration.take() {
                    self.configuration = Some(pending);
                }
                self.tracker.reset();
                self.release_device_async(device);
            }
        }
        self.write_error_holder.clear();
        self.init_error_holder.clear();
        self.silence.reset();
        self.dispatch_events();
    }

    /// Flush and return to the unconfigured state.
    pub fn reset(&mut self) {
        self.flush();
        self.pipeline.reset();
        self.configuration = None;
        self.pending_configuration = None;
        self.playing = false;
        self.offload_disabled_until_next_configure = false;
    }

    // Internal methods.

    fn ensure_device(&mut self) -> Result<bool> {
        if self.device.is_some() {
            return Ok(true);
        }
        // A previous device may still be releasing on the background
        // worker; opening another before it finishes could exhaust shared
        // device memory. Treat the device as not ready until then.
        if self.releasing.load(Ordering::Acquire) {
            return Ok(false);
        }
        let config = match &self.configuration {
            Some(config) => config.clone(),
            None => {
                return Err(SinkError::InvalidState(
                    "handle_buffer before configure".into(),
                ))
            }
        };

        let mut device = match self.provider.open(&config) {
            Ok(device) => device,
            Err(e) => {
                if config.output_mode == OutputMode::Offload {
                    // Offload may be unavailable despite the capability
                    // query; disable it until the next configure.
                    self.offload_disabled_until_next_configure = true;
                }
                return Err(e);
            }
        };

        info!(mode = ?config.output_mode, rate = device.sample_rate(), "output device open");
        self.tracker.set_device(
            device.as_mut(),
            config.output_mode == OutputMode::Passthrough,
            config.output_format.encoding,
            config.output_frame_bytes(),
            config.buffer_size_bytes,
        );
        device.set_volume(self.volume);
        self.device = Some(device);
        self.start_media_time_needs_init = true;
        Ok(true)
    }

    fn use_platform_speed(&self) -> bool {
        matches!(&self.configuration, Some(c) if c.enable_platform_speed)
    }

    /// Whether speed/pitch/silence adjustments run in the software pipeline
    /// for the current configuration
    fn should_apply_software_params(&self) -> bool {
        !self.tunneling
            && matches!(&self.configuration, Some(c) if c.output_mode == OutputMode::Pcm)
    }

    fn software_params_for(&self, _format: &StreamFormat) -> PlaybackParams {
        if self.prefer_platform_speed {
            PlaybackParams::default()
        } else {
            self.playback_params
        }
    }

    fn apply_device_playback_rate(&mut self) {
        if let Some(device) = self.device.as_mut() {
            if device.set_playback_rate(self.playback_params.speed, self.playback_params.pitch) {
                self.tracker
                    .set_device_playback_speed(self.playback_params.speed);
            } else {
                debug!("device refused playback rate; speed will be software-applied at next configure");
            }
        }
    }

    fn stage_software_params(&mut self) {
        if self.device.is_some() {
            // Drain first so the position at which the new parameters apply
            // is known exactly.
            self.after_drain_params = Some(self.playback_params);
        }
        // With no device open the parameters are picked up during
        // initialization.
    }

    fn apply_playback_params_and_skip_silence(&mut self, presentation_time_us: i64) {
        let processor_params = if !self.use_platform_speed() && self.should_apply_software_params()
        {
            self.playback_params
        } else {
            PlaybackParams::default()
        };
        let skip_silence = self.should_apply_software_params() && self.skip_silence_enabled;

        self.pipeline.set_playback_params(processor_params);
        self.pipeline.set_skip_silence(skip_silence);

        let device_position_us = match &self.configuration {
            Some(config) => config.frames_to_duration_us(self.written_frames()),
            None => 0,
        };
        self.checkpoints.push(MediaPositionCheckpoint {
            params: processor_params,
            media_time_us: presentation_time_us.max(0),
            device_position_us,
        });

        // Activate the staged stage configurations.
        self.pipeline.flush();
    }

    fn submitted_frames(&self) -> u64 {
        match &self.configuration {
            Some(c) if c.output_mode == OutputMode::Pcm => self.submitted_input_frames,
            _ => self.submitted_encoded_frames,
        }
    }

    fn written_frames(&self) -> u64 {
        match &self.configuration {
            Some(c) if c.output_mode == OutputMode::Pcm => {
                let channels = c.output_format.channels.max(1) as u64;
                // Round up so a partially written frame counts as written
                self.written_pcm_samples.div_ceil(channels)
            }
            _ => self.written_encoded_frames,
        }
    }

    /// Queue end of stream into the pipeline and drain everything pending.
    /// Returns whether the drain is complete.
    fn drain_to_end_of_stream(&mut self) -> Result<bool> {
        if !self.pipeline.is_operational() {
            self.process_buffers(self.last_feed_pts_us)?;
            return Ok(self
                .input_pending
                .as_ref()
                .map_or(true, |p| p.data.fully_consumed()));
        }

        // Hand any unqueued input to the pipeline before ending the stream.
        if let Some(PendingInput {
            data: PendingData::Pipeline { samples, queued },
            ..
        }) = self.input_pending.as_mut()
        {
            if !*queued {
                let samples = std::mem::take(samples);
                *queued = true;
                self.pipeline.queue_input(&samples);
            }
        }
        self.pipeline.queue_end_of_stream();
        self.process_buffers(self.last_feed_pts_us)?;
        Ok(self.pipeline.is_ended())
    }

    /// Repeatedly write pipeline output and feed it input until the device
    /// pushes back or there is nothing left to move.
    fn process_buffers(&mut self, presentation_time_us: i64) -> Result<()> {
        if self.pipeline.is_operational() {
            loop {
                if !self.write_pipeline_output(presentation_time_us)? {
                    // Device backpressure.
                    return Ok(());
                }
                let queued_more = match self.input_pending.as_mut() {
                    Some(PendingInput {
                        data: PendingData::Pipeline { samples, queued },
                        ..
                    }) if !*queued => {
                        let samples = std::mem::take(samples);
                        *queued = true;
                        self.pipeline.queue_input(&samples);
                        true
                    }
                    _ => false,
                };
                if !queued_more {
                    return Ok(());
                }
            }
        } else {
            self.write_direct(presentation_time_us)
        }
    }

    /// Write the pipeline's pending output to the device. Returns whether
    /// it was written completely.
    fn write_pipeline_output(&mut self, presentation_time_us: i64) -> Result<bool> {
        let written_frames = self.written_frames();
        let is_offload = matches!(
            &self.configuration,
            Some(c) if c.output_mode == OutputMode::Offload
        );
        let now_ms = self.clock.now_ms();

        let device = match self.device.as_mut() {
            Some(device) => device,
            None => return Ok(true),
        };
        let out = self.pipeline.output();
        if !out.has_remaining() {
            return Ok(true);
        }

        let requested = out.remaining().len();
        let result = device.write(WriteData::Pcm(out.remaining()), presentation_time_us);
        self.last_feed_time_ms = now_ms;
        match result {
            Ok(consumed) => {
                self.write_error_holder.clear();
                self.written_pcm_samples += consumed as u64;
                out.consume(consumed);
                Ok(consumed == requested)
            }
            Err(device_error) => {
                self.handle_write_error(device_error, written_frames, is_offload, now_ms)?;
                Ok(false)
            }
        }
    }

    /// Write directly from the pending input (no active pipeline stages).
    fn write_direct(&mut self, presentation_time_us: i64) -> Result<()> {
        let written_frames = self.written_frames();
        let (is_offload, frames_per_unit) = match &self.configuration {
            Some(c) => (
                c.output_mode == OutputMode::Offload,
                c.frames_per_encoded_unit,
            ),
            None => (false, 0),
        };
        let playing = self.playing;
        let now_ms = self.clock.now_ms();

        let pending = match self.input_pending.as_mut() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let device = match self.device.as_mut() {
            Some(device) => device,
            None => return Ok(()),
        };

        let unit_count = pending.unit_count;
        let (result, requested, encoded) = match &mut pending.data {
            PendingData::Direct { samples, consumed } => {
                let slice = &samples[*consumed..];
                if slice.is_empty() {
                    return Ok(());
                }
                let result = device.write(WriteData::Pcm(slice), presentation_time_us);
                (result, slice.len(), false)
            }
            PendingData::Encoded { bytes, consumed } => {
                let slice = &bytes[*consumed..];
                if slice.is_empty() {
                    return Ok(());
                }
                let result = device.write(WriteData::Encoded(slice), presentation_time_us);
                (result, slice.len(), true)
            }
            PendingData::Pipeline { .. } => return Ok(()),
        };
        self.last_feed_time_ms = now_ms;

        match result {
            Ok(consumed_now) => {
                self.write_error_holder.clear();
                match &mut pending.data {
                    PendingData::Direct { consumed, .. } => {
                        *consumed += consumed_now;
                        self.written_pcm_samples += consumed_now as u64;
                    }
                    PendingData::Encoded { bytes, consumed } => {
                        *consumed += consumed_now;
                        if *consumed >= bytes.len() {
                            self.written_encoded_frames +=
                                frames_per_unit as u64 * unit_count as u64;
                        }
                    }
                    PendingData::Pipeline { .. } => {}
                }
                if encoded && is_offload && playing && consumed_now < requested {
                    // The offload buffer could not take everything: it is
                    // full, and the producer can sleep until a data request.
                    self.pending_events.push(SinkEvent::OffloadBufferFull);
                }
                Ok(())
            }
            Err(device_error) => {
                self.handle_write_error(device_error, written_frames, is_offload, now_ms)
            }
        }
    }

    fn handle_write_error(
        &mut self,
        device_error: DeviceError,
        written_frames: u64,
        is_offload: bool,
        now_ms: i64,
    ) -> Result<()> {
        let is_dead = matches!(device_error, DeviceError::Disconnected);
        // A dead device that was already playing successfully can be
        // reopened and writing resumed; a dead offload device is recovered
        // by permanently downgrading out of offload for this configuration.
        let mut recoverable = false;
        if is_dead {
            if written_frames > 0 {
                recoverable = true;
            } else if is_offload {
                self.offload_disabled_until_next_configure = true;
                recoverable = true;
            }
        }
        let error = SinkError::Write {
            reason: device_error.to_string(),
            recoverable,
        };
        warn!(%error, "device write failed");
        if recoverable {
            self.pending_events.push(SinkEvent::RecoverableError {
                description: error.to_string(),
            });
            // Surface immediately so the caller can recover at its level.
            return Err(error);
        }
        self.write_error_holder.submit(error, now_ms)
    }

    /// Latch end-of-stream into the device so remaining buffered audio
    /// plays out while the reported position keeps advancing.
    fn play_pending_data(&mut self) {
        if self.stopped_device {
            return;
        }
        self.stopped_device = true;
        let written_frames = self.written_frames();
        if let Some(device) = self.device.as_mut() {
            self.tracker
                .handle_end_of_stream(device.as_mut(), written_frames);
            device.stop();
        }
    }

    fn reset_for_flush(&mut self) {
        self.submitted_input_frames = 0;
        self.submitted_encoded_frames = 0;
        self.written_pcm_samples = 0;
        self.written_encoded_frames = 0;
        self.checkpoints.reset(self.playback_params);
        self.start_media_time_us = 0;
        self.after_drain_params = None;
        self.input_pending = None;
        self.stopped_device = false;
        self.handled_end_of_stream = false;
        self.pipeline.reset_stream_counters();
        self.silence.reset();
        self.pipeline.flush();
    }

    fn release_device_async(&mut self, mut device: Box<dyn OutputDevice>) {
        self.releasing.store(true, Ordering::Release);
        let releasing = Arc::clone(&self.releasing);
        let released_tx = self.released_tx.clone();
        self.release_pool.release(Box::new(move || {
            // Teardown may block; that's why we're on the worker.
            device.flush();
            device.release();
            releasing.store(false, Ordering::Release);
            let _ = released_tx.send(());
        }));
    }

    fn dispatch_events(&mut self) {
        let elapsed_since_feed_ms = self.clock.now_ms() - self.last_feed_time_ms;
        let mut queued = std::mem::take(&mut self.pending_events);
        for tracker_event in self.tracker.take_events() {
            queued.push(crate::clock::tracker_event_to_sink_event(
                tracker_event,
                elapsed_since_feed_ms,
            ));
        }
        while self.released_rx.try_recv().is_ok() {
            queued.push(SinkEvent::DeviceReleased);
        }
        if let Some(listener) = self.listener.as_mut() {
            for event in queued {
                events::dispatch(listener.as_mut(), event);
            }
        }
    }
}
