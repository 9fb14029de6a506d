//! Remux queue - single-flight fragment to segment conversion
//!
//! Raw fragments wait in a bounded FIFO. One fragment at a time is pushed
//! through the [`RemuxEngine`]; its duration is remembered and attached to
//! whatever output the engine produces next.

use crate::{types::*, Error, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Converts transport-stream fragments into fragmented MP4 segments
pub trait RemuxEngine: Send {
    /// Feed the bytes of one fragment
    fn push(&mut self, data: &[u8]) -> Result<()>;

    /// Finish the fragment pushed last.
    ///
    /// Engines that produce output synchronously return it here. Engines
    /// that finish later return `None` and report through
    /// [`RemuxQueue::on_output`].
    fn flush(&mut self) -> Result<Option<RemuxOutput>>;
}

impl<T: RemuxEngine + ?Sized> RemuxEngine for Box<T> {
    fn push(&mut self, data: &[u8]) -> Result<()> {
        (**self).push(data)
    }

    fn flush(&mut self) -> Result<Option<RemuxOutput>> {
        (**self).flush()
    }
}

/// Notifications from the remux queue
#[derive(Debug)]
pub enum RemuxEvent {
    /// A segment is ready for the buffer controller
    Segment(ProducedSegment),
    /// The engine failed on a fragment, which was skipped
    Error(Error),
    /// No more segments will be produced. Emitted once.
    Ended,
}

/// Bounded single-flight queue in front of a remux engine
pub struct RemuxQueue<E> {
    engine: E,
    queue: VecDeque<Fragment>,
    capacity: usize,
    /// Duration of the fragment inside the engine, if any
    in_flight: Option<f64>,
    /// Last init segment the engine reported
    init_segment: Option<Bytes>,
    ended: bool,
    end_notified: bool,
    destroyed: bool,
    dropped: u64,
    events: VecDeque<RemuxEvent>,
}

impl<E: RemuxEngine> RemuxQueue<E> {
    pub fn new(engine: E, capacity: usize) -> Self {
        Self {
            engine,
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            in_flight: None,
            init_segment: None,
            ended: false,
            end_notified: false,
            destroyed: false,
            dropped: 0,
            events: VecDeque::new(),
        }
    }

    /// Queue a fragment, dropping the oldest one when full
    pub fn add_fragment(&mut self, fragment: Fragment) -> Result<()> {
        if self.ended {
            return Err(Error::FragmentAfterEnd);
        }

        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            debug!(
                capacity = self.capacity,
                dropped = self.dropped,
                "Remux queue cannot keep up, discarding oldest fragment"
            );
        }

        debug!(
            duration = fragment.duration,
            bytes = fragment.payload.len(),
            queue_len = self.queue.len() + 1,
            "Fragment queued"
        );
        self.queue.push_back(fragment);
        self.advance();
        Ok(())
    }

    /// No more fragments will be added
    pub fn end(&mut self) {
        self.ended = true;
        self.advance();
    }

    /// Output reported by an engine that finishes asynchronously
    pub fn on_output(&mut self, output: RemuxOutput) {
        if self.in_flight.is_none() {
            debug!("Ignoring engine output with no fragment in flight");
            return;
        }
        self.complete(output);
        self.advance();
    }

    /// Drop queued fragments and stop emitting events. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.ended = true;
        self.queue.clear();
        self.events.clear();
        self.advance();
    }

    pub fn poll_event(&mut self) -> Option<RemuxEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Fragments discarded on overflow
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Push fragments through the engine until one is left in flight or the queue is empty
    fn advance(&mut self) {
        loop {
            if self.in_flight.is_some() {
                return;
            }

            let Some(fragment) = self.queue.pop_front() else {
                if self.ended && !self.end_notified {
                    self.end_notified = true;
                    info!("Remux queue reached the end of the stream");
                    self.emit(RemuxEvent::Ended);
                }
                return;
            };

            debug!(
                duration = fragment.duration,
                bytes = fragment.payload.len(),
                "Pushing fragment to the remux engine"
            );
            self.in_flight = Some(fragment.duration);

            let result = self
                .engine
                .push(&fragment.payload)
                .and_then(|_| self.engine.flush());
            match result {
                Ok(Some(output)) => self.complete(output),
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "Remux engine rejected fragment");
                    self.in_flight = None;
                    self.emit(RemuxEvent::Error(err));
                }
            }
        }
    }

    fn complete(&mut self, output: RemuxOutput) {
        let duration = self.in_flight.take().unwrap_or_default();

        if let Some(init) = output.init_segment.filter(|init| !init.is_empty()) {
            self.init_segment = Some(init);
        }

        let Some(init_segment) = self.init_segment.clone() else {
            warn!(
                bytes = output.data.len(),
                "Dropping remuxed segment, no init segment seen yet"
            );
            return;
        };

        debug!(
            duration,
            init_bytes = init_segment.len(),
            data_bytes = output.data.len(),
            "Segment remuxed"
        );
        self.emit(RemuxEvent::Segment(ProducedSegment {
            duration,
            init_segment,
            media_segment: output.data,
        }));
    }

    fn emit(&mut self, event: RemuxEvent) {
        if !self.destroyed {
            self.events.push_back(event);
        }
    }
}
