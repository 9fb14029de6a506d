//! Playback buffer controller
//!
//! Handles:
//! - Codec detection from the first init segment
//! - Sink buffer creation once the sink is open and codecs are known
//! - One pending append or removal at a time, eviction first
//! - Live-edge catch-up on playback position updates

use crate::{
    config::{resolve_max_delay, ClientConfig},
    mp4::parse_init_segment,
    types::*,
    Error, Result,
};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Time-addressable live buffer the controller appends into.
///
/// `append_buffer` and `remove` start an operation; the owner reports its
/// completion through [`BufferController::on_update_end`].
pub trait BufferSink: Send {
    /// Create the sink buffer for a MIME type
    fn add_source_buffer(&mut self, mime_type: &str) -> Result<()>;
    fn append_buffer(&mut self, data: Bytes) -> Result<()>;
    fn remove(&mut self, start: f64, end: f64) -> Result<()>;
    fn end_of_stream(&mut self) -> Result<()>;
    /// Buffered time ranges in seconds, oldest first
    fn buffered(&self) -> Vec<(f64, f64)>;
}

impl<T: BufferSink + ?Sized> BufferSink for Box<T> {
    fn add_source_buffer(&mut self, mime_type: &str) -> Result<()> {
        (**self).add_source_buffer(mime_type)
    }

    fn append_buffer(&mut self, data: Bytes) -> Result<()> {
        (**self).append_buffer(data)
    }

    fn remove(&mut self, start: f64, end: f64) -> Result<()> {
        (**self).remove(start, end)
    }

    fn end_of_stream(&mut self) -> Result<()> {
        (**self).end_of_stream()
    }

    fn buffered(&self) -> Vec<(f64, f64)> {
        (**self).buffered()
    }
}

/// Host playback element
pub trait PlaybackElement: Send {
    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
    fn paused(&self) -> bool;
    fn set_current_time(&mut self, time: f64);
}

/// Notifications from the buffer controller
#[derive(Debug)]
pub enum MediaEvent {
    /// Codec detection or a sink operation failed
    Error(Error),
    /// The sink buffer was created
    SinkCreated { mime_type: String },
    /// End of stream reached. Emitted once.
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingOp {
    Append { duration: f64 },
    Remove { span: f64 },
}

/// Buffer controller driving one sink
pub struct BufferController<S> {
    sink: S,
    element: Option<Box<dyn PlaybackElement>>,

    delay: f64,
    max_delay: f64,
    max_buffer_duration: f64,

    sink_open: bool,
    buffer_created: bool,
    pending: Option<PendingOp>,
    /// Duration of completed appends minus completed removals
    buffered_duration: f64,
    init_appended: bool,

    queue: VecDeque<ProducedSegment>,
    capacity: usize,
    dropped: u64,
    codecs: Option<CodecDescriptor>,

    ended: bool,
    end_signalled: bool,
    destroyed: bool,
    events: VecDeque<MediaEvent>,
}

impl<S: BufferSink> BufferController<S> {
    /// Create a controller with the delay and buffer limits of `config`
    pub fn new(sink: S, config: &ClientConfig) -> Self {
        Self {
            sink,
            element: None,
            delay: config.delay,
            max_delay: config.max_delay(),
            max_buffer_duration: config.max_buffer_duration(),
            sink_open: false,
            buffer_created: false,
            pending: None,
            buffered_duration: 0.0,
            init_appended: false,
            queue: VecDeque::new(),
            capacity: config.max_segment_queue_length.max(1),
            dropped: 0,
            codecs: None,
            ended: false,
            end_signalled: false,
            destroyed: false,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> BufferState {
        if self.end_signalled {
            return BufferState::Ended;
        }
        if !self.buffer_created {
            return BufferState::NoSinkBuffer;
        }
        match self.pending {
            Some(PendingOp::Append { .. }) => BufferState::Appending,
            Some(PendingOp::Remove { .. }) => BufferState::Evicting,
            None => BufferState::Buffering,
        }
    }

    pub fn codecs(&self) -> Option<&CodecDescriptor> {
        self.codecs.as_ref()
    }

    pub fn buffered_duration(&self) -> f64 {
        self.buffered_duration
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Segments discarded on overflow
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn max_delay(&self) -> f64 {
        self.max_delay
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn poll_event(&mut self) -> Option<MediaEvent> {
        self.events.pop_front()
    }

    /// Queue a produced segment, dropping the oldest one when full
    pub fn add_segment(&mut self, segment: ProducedSegment) -> Result<()> {
        if self.ended {
            return Err(Error::SegmentAfterEnd);
        }

        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            debug!(
                capacity = self.capacity,
                dropped = self.dropped,
                "Segment queue full, discarding oldest segment"
            );
        }

        if self.codecs.is_none() {
            self.detect_codecs(&segment.init_segment);
        }

        self.queue.push_back(segment);
        self.advance();
        Ok(())
    }

    /// No more segments will be added
    pub fn end(&mut self) {
        self.ended = true;
        self.advance();
    }

    /// The sink is ready to create its buffer
    pub fn on_sink_open(&mut self) {
        if !self.sink_open {
            debug!("Buffer sink open");
            self.sink_open = true;
        }
        self.advance();
    }

    /// The pending sink operation finished
    pub fn on_update_end(&mut self) {
        match self.pending.take() {
            Some(PendingOp::Append { duration }) => {
                self.buffered_duration += duration;
            }
            Some(PendingOp::Remove { span }) => {
                self.buffered_duration = (self.buffered_duration - span).max(0.0);
            }
            None => debug!("Ignoring update end with no pending operation"),
        }
        self.advance();
    }

    pub fn set_delay_options(&mut self, delay: f64, max_delay: Option<f64>) {
        self.delay = delay;
        self.max_delay = resolve_max_delay(delay, max_delay);
        debug!(delay = self.delay, max_delay = self.max_delay, "Delay options updated");
    }

    pub fn attach_media(&mut self, element: Box<dyn PlaybackElement>) {
        self.element = Some(element);
    }

    pub fn detach_media(&mut self) -> Option<Box<dyn PlaybackElement>> {
        self.element.take()
    }

    pub fn has_media(&self) -> bool {
        self.element.is_some()
    }

    /// Check the playback position against the live edge.
    /// Returns true if a catch-up seek was issued.
    pub fn on_time_update(&mut self) -> bool {
        let Some(element) = self.element.as_mut() else {
            return false;
        };
        if element.paused() {
            return false;
        }

        let duration = element.duration();
        if !duration.is_finite() {
            return false;
        }

        let current = element.current_time();
        let gap = duration - current;
        if gap <= self.max_delay {
            return false;
        }

        let target = (duration - self.delay).max(0.0);
        info!(
            gap,
            max_delay = self.max_delay,
            from = current,
            to = target,
            "Behind the live edge, seeking"
        );
        element.set_current_time(target);
        true
    }

    /// Detach media, drop queued segments and end. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.element = None;
        self.destroyed = true;
        self.ended = true;
        self.queue.clear();
        self.events.clear();
        self.advance();
    }

    fn detect_codecs(&mut self, init_segment: &[u8]) {
        match parse_init_segment(init_segment) {
            Ok(init) if !init.is_empty() => {
                let codecs = init.codecs();
                info!(
                    audio = %codecs.audio_codec,
                    video = %codecs.video_codec,
                    "Codecs detected"
                );
                self.codecs = Some(codecs);
            }
            Ok(_) => {
                warn!("Init segment has no audio or video track");
                self.emit(MediaEvent::Error(Error::NoMediaTracks));
            }
            Err(err) => {
                warn!(error = %err, "Could not detect codecs");
                self.emit(MediaEvent::Error(err));
            }
        }
    }

    fn advance(&mut self) {
        loop {
            if self.end_signalled {
                return;
            }

            if !self.buffer_created && !self.create_buffer() {
                // Segments wait for the sink buffer; only an empty queue can end
                if self.queue.is_empty() && self.ended && self.pending.is_none() {
                    self.signal_end();
                }
                return;
            }

            if self.pending.is_some() {
                return;
            }

            if self.queue.is_empty() {
                if self.ended {
                    self.signal_end();
                }
                return;
            }

            if self.buffered_duration > self.max_buffer_duration {
                if self.evict() {
                    return;
                }
                continue;
            }

            self.append_next();
        }
    }

    /// Returns true once the sink buffer exists
    fn create_buffer(&mut self) -> bool {
        if self.destroyed || !self.sink_open {
            return false;
        }
        let Some(codecs) = self.codecs.as_ref() else {
            return false;
        };

        let mime_type = codecs.mime_type();
        match self.sink.add_source_buffer(&mime_type) {
            Ok(()) => {
                info!(mime_type = %mime_type, "Sink buffer created");
                self.buffer_created = true;
                self.buffered_duration = 0.0;
                self.emit(MediaEvent::SinkCreated { mime_type });
                true
            }
            Err(err) => {
                warn!(error = %err, mime_type = %mime_type, "Could not create sink buffer");
                // Detection is retried with the next segment
                self.codecs = None;
                self.emit(MediaEvent::Error(err));
                false
            }
        }
    }

    /// Remove the oldest excess span. Returns true if a removal is pending.
    fn evict(&mut self) -> bool {
        let excess = self.buffered_duration - self.max_buffer_duration;
        let start = self
            .sink
            .buffered()
            .first()
            .map(|(start, _)| *start)
            .unwrap_or_default();
        let end = start + excess;

        debug!(
            start,
            end,
            buffered = self.buffered_duration,
            max = self.max_buffer_duration,
            "Evicting buffered media"
        );

        match self.sink.remove(start, end) {
            Ok(()) => {
                self.pending = Some(PendingOp::Remove { span: excess });
                true
            }
            Err(err) => {
                warn!(error = %err, "Sink removal failed, skipping eviction");
                self.buffered_duration = self.max_buffer_duration;
                self.emit(MediaEvent::Error(err));
                false
            }
        }
    }

    fn append_next(&mut self) {
        let Some(segment) = self.queue.pop_front() else {
            return;
        };

        let data = if self.init_appended {
            segment.media_segment
        } else {
            let mut buf =
                BytesMut::with_capacity(segment.init_segment.len() + segment.media_segment.len());
            buf.extend_from_slice(&segment.init_segment);
            buf.extend_from_slice(&segment.media_segment);
            buf.freeze()
        };

        debug!(
            duration = segment.duration,
            bytes = data.len(),
            with_init = !self.init_appended,
            "Appending segment"
        );

        match self.sink.append_buffer(data) {
            Ok(()) => {
                self.init_appended = true;
                self.pending = Some(PendingOp::Append {
                    duration: segment.duration,
                });
            }
            Err(err) => {
                warn!(error = %err, "Sink append failed, segment dropped");
                self.emit(MediaEvent::Error(err));
            }
        }
    }

    fn signal_end(&mut self) {
        self.end_signalled = true;
        if self.sink_open {
            if let Err(err) = self.sink.end_of_stream() {
                warn!(error = %err, "Could not signal end of stream");
                self.emit(MediaEvent::Error(err));
            }
        }
        info!(buffered = self.buffered_duration, "Playback buffer ended");
        self.emit(MediaEvent::Ended);
    }

    fn emit(&mut self, event: MediaEvent) {
        if !self.destroyed {
            self.events.push_back(event);
        }
    }
}
