//! Reasoning/answer phase classification
//!
//! Backends disagree on how reasoning is delivered: some use a dedicated
//! field, some wrap it in markers inside the ordinary content, some stop the
//! reasoning field and then close with a marker in the content. The
//! classifier turns all of these into one ordered sequence of phase events,
//! driven by the [`ReasoningBoundary`] a normalizer declares.

use crate::interpreter::MAX_HOLDBACK_BYTES;
use murmur_ai::ReasoningBoundary;

/// Where a segment currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Thinking,
    Answering,
    Done,
}

/// Output of the classifier, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Reasoning(String),
    /// Thinking closed; carries the whole reasoning text of the segment
    ReasoningComplete(String),
    Content(String),
}

/// Per-segment phase state machine: `Idle -> Thinking -> Answering -> Done`
#[derive(Debug)]
pub struct PhaseClassifier {
    boundary: ReasoningBoundary,
    phase: Phase,
    /// Reasoning is arriving inside the content, opened by an open marker
    inline: bool,
    /// Drop leading whitespace of the first answer text after a close marker
    strip_leading: bool,
    reasoning: String,
    /// Content that may still turn out to be (part of) a marker
    pending: String,
}

impl PhaseClassifier {
    pub fn new(boundary: ReasoningBoundary) -> Self {
        Self {
            boundary,
            phase: Phase::Idle,
            inline: false,
            strip_leading: false,
            reasoning: String::new(),
            pending: String::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Reasoning accumulated so far in this segment
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Text from a dedicated reasoning field
    pub fn push_reasoning(&mut self, text: &str) -> Vec<PhaseEvent> {
        if text.is_empty() {
            return vec![];
        }
        match self.phase {
            Phase::Idle | Phase::Thinking => {
                self.phase = Phase::Thinking;
                self.reasoning.push_str(text);
                vec![PhaseEvent::Reasoning(text.to_string())]
            }
            Phase::Answering | Phase::Done => {
                tracing::debug!(
                    "Dropping {} bytes of reasoning received after the answer started",
                    text.len()
                );
                vec![]
            }
        }
    }

    /// Text from the ordinary content field
    pub fn push_content(&mut self, text: &str) -> Vec<PhaseEvent> {
        if text.is_empty() {
            return vec![];
        }
        match self.phase {
            Phase::Done => vec![],
            Phase::Answering => self.answer(text.to_string()).into_iter().collect(),
            Phase::Idle | Phase::Thinking => {
                self.pending.push_str(text);
                let mut events = Vec::new();
                self.resolve(&mut events);
                events
            }
        }
    }

    /// Finish signal (or end of stream). Flushes held-back text to the phase it
    /// belongs to and closes an open thinking phase. Idempotent.
    pub fn finish(&mut self) -> Vec<PhaseEvent> {
        let mut events = Vec::new();
        match self.phase {
            Phase::Done | Phase::Answering => {}
            Phase::Idle => {
                let rest = std::mem::take(&mut self.pending);
                if !rest.is_empty() {
                    events.push(PhaseEvent::Content(rest));
                }
            }
            Phase::Thinking => {
                let rest = std::mem::take(&mut self.pending);
                if self.inline {
                    self.emit_reasoning(rest, &mut events);
                    self.close_thinking(&mut events);
                } else {
                    self.close_thinking(&mut events);
                    if !rest.is_empty() {
                        events.push(PhaseEvent::Content(rest));
                    }
                }
            }
        }
        self.phase = Phase::Done;
        events
    }

    fn resolve(&mut self, events: &mut Vec<PhaseEvent>) {
        if self.phase == Phase::Idle {
            let lead = self.pending.trim_start();
            if lead.is_empty() {
                return;
            }
            let leading_ws = self.pending.len() - lead.len();

            if let Some(len) = starts_with_any(lead, &self.boundary.open_markers) {
                self.pending.drain(..leading_ws + len);
                self.phase = Phase::Thinking;
                self.inline = true;
            } else if let Some(len) = starts_with_any(lead, &self.boundary.close_markers) {
                // Close marker without any reasoning before it
                self.pending.drain(..leading_ws + len);
                self.phase = Phase::Answering;
                self.strip_leading = true;
                let rest = std::mem::take(&mut self.pending);
                events.extend(self.answer(rest));
                return;
            } else if is_proper_prefix_of_any(lead, &self.boundary.open_markers)
                || is_proper_prefix_of_any(lead, &self.boundary.close_markers)
            {
                return;
            } else if self.boundary.reasoning_before_close {
                self.hold_until_close(events);
                return;
            } else {
                self.phase = Phase::Answering;
                let rest = std::mem::take(&mut self.pending);
                events.push(PhaseEvent::Content(rest));
                return;
            }
        }

        if let Some((pos, len)) = find_first(&self.pending, &self.boundary.close_markers) {
            let after = self.pending.split_off(pos + len);
            self.pending.truncate(pos);
            let before = std::mem::take(&mut self.pending);
            self.emit_reasoning(before, events);
            self.close_thinking(events);
            self.strip_leading = true;
            events.extend(self.answer(after));
            return;
        }

        if self.inline {
            let hold = partial_marker_suffix(&self.pending, &self.boundary.close_markers);
            let ready = self.pending.len() - hold;
            if ready > 0 {
                let part: String = self.pending.drain(..ready).collect();
                self.emit_reasoning(part, events);
            }
            return;
        }

        // Reasoning came from a field; ordinary content ends it unless the
        // content so far could still be a close marker.
        let lead = self.pending.trim_start();
        if lead.is_empty() || is_proper_prefix_of_any(lead, &self.boundary.close_markers) {
            return;
        }
        self.close_thinking(events);
        let rest = std::mem::take(&mut self.pending);
        events.push(PhaseEvent::Content(rest));
    }

    /// Without an open marker, content up to the first close marker is
    /// reasoning. Held back in Idle, capped like the tool-call holdback.
    fn hold_until_close(&mut self, events: &mut Vec<PhaseEvent>) {
        if let Some((pos, len)) = find_first(&self.pending, &self.boundary.close_markers) {
            let after = self.pending.split_off(pos + len);
            self.pending.truncate(pos);
            let before = std::mem::take(&mut self.pending);
            self.emit_reasoning(before, events);
            self.close_thinking(events);
            self.strip_leading = true;
            events.extend(self.answer(after));
        } else if self.pending.len() > MAX_HOLDBACK_BYTES {
            tracing::debug!(
                "No close marker within {} bytes, releasing held content as answer",
                MAX_HOLDBACK_BYTES
            );
            self.phase = Phase::Answering;
            let rest = std::mem::take(&mut self.pending);
            events.push(PhaseEvent::Content(rest));
        }
    }

    fn answer(&mut self, text: String) -> Option<PhaseEvent> {
        let text = if self.strip_leading {
            let trimmed = text.trim_start();
            if trimmed.is_empty() {
                return None;
            }
            self.strip_leading = false;
            trimmed.to_string()
        } else {
            text
        };
        if text.is_empty() {
            None
        } else {
            Some(PhaseEvent::Content(text))
        }
    }

    fn emit_reasoning(&mut self, text: String, events: &mut Vec<PhaseEvent>) {
        let text = if self.reasoning.is_empty() {
            text.trim_start().to_string()
        } else {
            text
        };
        if !text.is_empty() {
            self.reasoning.push_str(&text);
            events.push(PhaseEvent::Reasoning(text));
        }
    }

    fn close_thinking(&mut self, events: &mut Vec<PhaseEvent>) {
        events.push(PhaseEvent::ReasoningComplete(self.reasoning.clone()));
        self.phase = Phase::Answering;
        self.inline = false;
    }
}

/// Length of the first marker `text` starts with
fn starts_with_any(text: &str, markers: &[String]) -> Option<usize> {
    markers
        .iter()
        .find(|m| !m.is_empty() && text.starts_with(m.as_str()))
        .map(|m| m.len())
}

fn is_proper_prefix_of_any(text: &str, markers: &[String]) -> bool {
    markers
        .iter()
        .any(|m| m.len() > text.len() && m.starts_with(text))
}

/// Earliest marker occurrence as `(position, marker length)`
fn find_first(text: &str, markers: &[String]) -> Option<(usize, usize)> {
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .filter_map(|m| text.find(m.as_str()).map(|pos| (pos, m.len())))
        .min_by_key(|&(pos, _)| pos)
}

/// Length of the longest suffix of `text` that is a proper prefix of a marker
fn partial_marker_suffix(text: &str, markers: &[String]) -> usize {
    markers
        .iter()
        .flat_map(|m| {
            (1..m.len())
                .filter(|&k| m.is_char_boundary(k) && text.ends_with(&m[..k]))
                .max()
        })
        .max()
        .unwrap_or(0)
}
