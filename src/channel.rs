//! Backpressure bridge between an uncontrolled byte source and a paced
//! consumer.
//!
//! Three independently-paced actors meet here: the network source producing
//! row batches, a bounded pending-row queue, and the consumer pulling rows
//! one at a time. [`FlowState`] is the explicit state machine tying them
//! together so the backpressure invariant (queue length versus source pause
//! state) is testable without any I/O.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::Stream;

use crate::error::Result;
use crate::types::Row;

/// Default pending-row count above which the source is paused.
pub const DEFAULT_HIGH_WATERMARK: usize = 100;

/// What the driver must do with the byte source after a state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceAction {
    /// Keep going.
    None,
    /// Stop reading from the source until a `Resume` is signalled.
    Pause,
    /// The queue has drained enough; reading may continue.
    Resume,
}

/// Bounded FIFO of hydrated rows plus the pause/finish flags that drive
/// upstream flow control.
///
/// Exclusively owned by one stream; transitions are interleaved, never
/// concurrent.
#[derive(Debug)]
pub struct FlowState {
    queue: VecDeque<Row>,
    high_watermark: usize,
    low_watermark: usize,
    paused: bool,
    finished: bool,
}

impl FlowState {
    /// New state with the given high watermark; the low watermark is one
    /// quarter of it, which keeps pause/resume from thrashing.
    pub fn new(high_watermark: usize) -> Self {
        let high_watermark = high_watermark.max(1);
        Self {
            queue: VecDeque::new(),
            high_watermark,
            // Strictly below the high watermark, even for tiny values.
            low_watermark: (high_watermark / 4).min(high_watermark - 1),
            paused: false,
            finished: false,
        }
    }

    /// Append a batch of hydrated rows; returns `Pause` once the queue
    /// exceeds the high watermark while the source is running.
    pub fn push_rows(&mut self, rows: Vec<Row>) -> SourceAction {
        self.queue.extend(rows);
        if !self.paused && self.queue.len() > self.high_watermark {
            self.paused = true;
            tracing::debug!(pending = self.queue.len(), "pausing result source");
            SourceAction::Pause
        } else {
            SourceAction::None
        }
    }

    /// Deliver the next row, if any; returns `Resume` when the queue has
    /// drained to the low watermark while paused.
    pub fn pop(&mut self) -> (Option<Row>, SourceAction) {
        let row = self.queue.pop_front();
        if self.paused && self.queue.len() <= self.low_watermark {
            self.paused = false;
            tracing::debug!(pending = self.queue.len(), "resuming result source");
            (row, SourceAction::Resume)
        } else {
            (row, SourceAction::None)
        }
    }

    /// Record that the terminal success frame was seen.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Force-clear the pause flag. Teardown must resume a paused source
    /// before the transport is released.
    pub fn resume_for_teardown(&mut self) -> SourceAction {
        if self.paused {
            self.paused = false;
            SourceAction::Resume
        } else {
            SourceAction::None
        }
    }

    /// True while the source must not be read.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True once the terminal success frame was seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Rows currently queued.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// End of the sequence: the success frame was seen and every queued row
    /// was delivered.
    pub fn is_complete(&self) -> bool {
        self.finished && self.queue.is_empty()
    }
}

/// A lazy, finite, one-shot sequence of hydrated rows. Not restartable.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row>> + Send>>;
