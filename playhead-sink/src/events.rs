//! Event surface of the sink
//!
//! The sink reports asynchronous observations (underrun, spurious hardware
//! timestamps, skipped silence, ...) through [`SinkListener`]. All callbacks
//! are invoked on the thread driving the sink; none of them may block.

/// Which sanity check a rejected hardware timestamp failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpuriousTimestampKind {
    /// The timestamp's system time was too far from the current time
    SystemTimeMismatch,
    /// The timestamp's position was too far from the counter-derived position
    PositionMismatch,
}

/// Events emitted by the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// The reported position increased for the first time since the sink was
    /// last started or reset. Carries the derived wall-clock time at which
    /// playout started, in milliseconds.
    PositionAdvancing { playout_start_ms: i64 },

    /// The device ran out of data while playing.
    Underrun {
        /// Device buffer size in bytes
        buffer_size: usize,
        /// Device buffer duration in milliseconds, or None for encoded
        /// output where the buffered duration is unknown
        buffer_duration_ms: Option<i64>,
        /// Time since the sink last fed the device, in milliseconds
        elapsed_since_last_feed_ms: i64,
    },

    /// The device reported an impossibly large latency; it was ignored.
    InvalidLatency { latency_us: i64 },

    /// A hardware timestamp failed a sanity check and was rejected.
    SpuriousTimestamp {
        kind: SpuriousTimestampKind,
        timestamp_position_frames: u64,
        timestamp_system_time_us: i64,
        system_time_us: i64,
        playback_position_us: i64,
    },

    /// The media timeline jumped: presentation times diverged from the
    /// expected value and the sink resynchronized its start time.
    PositionDiscontinuity,

    /// Silence was elided by the silence-skipping stage. Adjacent skips
    /// within the debounce window are batched into a single event.
    SilenceSkipped { duration_us: i64 },

    /// A non-blocking write to an offload device could not accept all data
    /// while playing (the offload buffer is full).
    OffloadBufferFull,

    /// An asynchronously released device has finished tearing down.
    DeviceReleased,

    /// A recoverable sink error occurred and was handled internally.
    RecoverableError { description: String },
}

/// Listener for sink events.
///
/// All methods have default no-op implementations; implement the ones of
/// interest. [`SinkListener::on_event`] receives every event and is the
/// single required override for listeners that fan out themselves.
pub trait SinkListener {
    /// Called for every event, before the specific callbacks below.
    fn on_event(&mut self, _event: &SinkEvent) {}

    fn on_position_advancing(&mut self, _playout_start_ms: i64) {}

    fn on_underrun(
        &mut self,
        _buffer_size: usize,
        _buffer_duration_ms: Option<i64>,
        _elapsed_since_last_feed_ms: i64,
    ) {
    }

    fn on_position_discontinuity(&mut self) {}

    fn on_silence_skipped(&mut self, _duration_us: i64) {}
}

/// Dispatch an event to a listener: the generic hook first, then the
/// matching specific callback.
pub(crate) fn dispatch(listener: &mut dyn SinkListener, event: SinkEvent) {
    listener.on_event(&event);
    match event {
        SinkEvent::PositionAdvancing { playout_start_ms } => {
            listener.on_position_advancing(playout_start_ms)
        }
        SinkEvent::Underrun {
            buffer_size,
            buffer_duration_ms,
            elapsed_since_last_feed_ms,
        } => listener.on_underrun(buffer_size, buffer_duration_ms, elapsed_since_last_feed_ms),
        SinkEvent::PositionDiscontinuity => listener.on_position_discontinuity(),
        SinkEvent::SilenceSkipped { duration_us } => listener.on_silence_skipped(duration_us),
        _ => {}
    }
}
