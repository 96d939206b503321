use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::record::{CompletionSender, LogRecord};

/// A buffered record together with the sender that resolves its caller's
/// completion.
#[derive(Debug)]
pub(crate) struct Pending {
    pub record: LogRecord,
    pub completion: CompletionSender,
    /// Failed submit attempts so far.
    pub attempts: u32,
}

impl Pending {
    pub fn new(record: LogRecord, completion: CompletionSender) -> Self {
        Self {
            record,
            completion,
            attempts: 0,
        }
    }
}

/// Ordered pending buffer. Owned by the flush task; nothing else touches it.
#[derive(Debug)]
pub(crate) struct Batcher {
    buffer: VecDeque<Pending>,
    max_buffer_size: usize,
}

impl Batcher {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_buffer_size: max_buffer_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_buffer_size
    }

    /// Appends a record. Returns true when the buffer reached its threshold
    /// and must be flushed before anything else is buffered.
    pub fn add(&mut self, pending: Pending) -> bool {
        self.buffer.push_back(pending);
        self.is_full()
    }

    pub fn drain(&mut self) -> Vec<Pending> {
        self.buffer.drain(..).collect()
    }

    /// Puts records from a failed flush back at the head, ahead of anything
    /// added since, keeping their relative order.
    pub fn requeue_front(&mut self, entries: Vec<Pending>) {
        for entry in entries.into_iter().rev() {
            self.buffer.push_front(entry);
        }
    }

    pub fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.buffer.front().map(|p| p.record.enqueued_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogCompletion, LogOptions};
    use pretty_assertions::assert_eq;

    fn pending(content: &str) -> Pending {
        let record = LogRecord::new(content.into(), LogOptions::default());
        let (tx, _completion) = LogCompletion::channel(record.id.clone());
        Pending::new(record, tx)
    }

    fn contents(entries: &[Pending]) -> Vec<String> {
        entries
            .iter()
            .map(|p| p.record.content.as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn add_signals_flush_at_threshold() {
        let mut batcher = Batcher::new(3);
        assert!(!batcher.add(pending("a")));
        assert!(!batcher.add(pending("b")));
        assert!(batcher.add(pending("c")));
        assert_eq!(batcher.len(), 3);
    }

    #[test]
    fn drain_empties_in_enqueue_order() {
        let mut batcher = Batcher::new(10);
        for c in ["a", "b", "c"] {
            batcher.add(pending(c));
        }

        let drained = batcher.drain();
        assert_eq!(contents(&drained), vec!["a", "b", "c"]);
        assert!(batcher.is_empty());
        assert!(batcher.drain().is_empty());
    }

    #[test]
    fn requeue_front_places_failed_records_before_newer_ones() {
        let mut batcher = Batcher::new(10);
        batcher.add(pending("a"));
        batcher.add(pending("b"));
        let failed = batcher.drain();

        batcher.add(pending("c"));
        batcher.requeue_front(failed);

        assert_eq!(contents(&batcher.drain()), vec!["a", "b", "c"]);
    }

    #[test]
    fn oldest_enqueued_at_tracks_head() {
        let mut batcher = Batcher::new(10);
        assert_eq!(batcher.oldest_enqueued_at(), None);
        let first = pending("a");
        let at = first.record.enqueued_at;
        batcher.add(first);
        batcher.add(pending("b"));
        assert_eq!(batcher.oldest_enqueued_at(), Some(at));
    }

    #[test]
    fn zero_threshold_is_clamped_to_one() {
        let mut batcher = Batcher::new(0);
        assert!(batcher.add(pending("a")));
    }
}
