//! Reasoning-segment classifier.
//!
//! Models that reason out loud wrap the reasoning in delimiter tags. The
//! classifier consumes decoded text in arbitrary chunks and splits it into
//! [`ThoughtEvent`]s and content without ever emitting a tag fragment: text
//! that could be the start of a delimiter is held back until the next chunk
//! decides it.

use crate::protocol::{InferenceEvent, ThoughtEvent};

pub const DEFAULT_THINK_START: &str = "<think>";
pub const DEFAULT_THINK_END: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Content,
    Thought,
}

/// Incremental splitter for `<think>`-style output.
#[derive(Debug, Clone)]
pub struct OutputClassifier {
    start: String,
    end: String,
    segment: Segment,
    pending: String,
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_THINK_START, DEFAULT_THINK_END)
    }
}

impl OutputClassifier {
    /// An empty delimiter never matches, so an empty `start` disables
    /// reasoning detection entirely.
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            segment: Segment::Content,
            pending: String::new(),
        }
    }

    pub fn in_thought(&self) -> bool {
        self.segment == Segment::Thought
    }

    /// Feed one decoded chunk.
    pub fn push(&mut self, chunk: &str) -> Vec<InferenceEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let delimiter = match self.segment {
                Segment::Content => self.start.as_str(),
                Segment::Thought => self.end.as_str(),
            };
            let found = if delimiter.is_empty() {
                None
            } else {
                self.pending.find(delimiter).map(|pos| (pos, delimiter.len()))
            };
            let held = match found {
                Some(_) => 0,
                None => partial_suffix_len(&self.pending, delimiter),
            };

            match found {
                Some((pos, len)) => {
                    let text: String = self.pending.drain(..pos).collect();
                    self.emit(text, &mut events);
                    self.pending.drain(..len);
                    self.switch(&mut events);
                }
                None => {
                    let flush_to = self.pending.len() - held;
                    if flush_to > 0 {
                        let text: String = self.pending.drain(..flush_to).collect();
                        self.emit(text, &mut events);
                    }
                    break;
                }
            }
        }

        events
    }

    /// End of stream. Held-back text is released as-is and an open reasoning
    /// segment is closed.
    pub fn finish(&mut self) -> Vec<InferenceEvent> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        self.emit(rest, &mut events);
        if self.segment == Segment::Thought {
            events.push(InferenceEvent::Thought(ThoughtEvent::Stop));
            self.segment = Segment::Content;
        }
        events
    }

    fn emit(&self, text: String, events: &mut Vec<InferenceEvent>) {
        if text.is_empty() {
            return;
        }
        events.push(match self.segment {
            Segment::Content => InferenceEvent::Content(text),
            Segment::Thought => InferenceEvent::Thought(ThoughtEvent::Delta(text)),
        });
    }

    fn switch(&mut self, events: &mut Vec<InferenceEvent>) {
        self.segment = match self.segment {
            Segment::Content => {
                events.push(InferenceEvent::Thought(ThoughtEvent::Start));
                Segment::Thought
            }
            Segment::Thought => {
                events.push(InferenceEvent::Thought(ThoughtEvent::Stop));
                Segment::Content
            }
        };
    }
}

/// Length of the longest proper prefix of `delimiter` that `text` ends with.
fn partial_suffix_len(text: &str, delimiter: &str) -> usize {
    if delimiter.is_empty() {
        return 0;
    }
    let max = text.len().min(delimiter.len() - 1);
    (1..=max)
        .rev()
        .find(|&k| {
            let split = text.len() - k;
            text.is_char_boundary(split)
                && delimiter.is_char_boundary(k)
                && text[split..] == delimiter[..k]
        })
        .unwrap_or(0)
}

/// Whether an event should reach the caller given its reasoning preference.
pub fn is_visible(event: &InferenceEvent, show_thinking: bool) -> bool {
    show_thinking || !matches!(event, InferenceEvent::Thought(_))
}
