//! Per-turn user transcript accumulation.
//!
//! Upstream reports the user's words through several overlapping signals:
//! incremental deltas, whole-text partials, a `completed` event and the
//! transcript attached to the created conversation item. The client must see
//! exactly one final transcript per turn, and it must arrive before the
//! assistant starts answering whenever upstream has produced any text by then.
//!
//! A turn is finalized at the first of:
//! - speech stopped, if whole-text partials have accumulated;
//! - a partial arriving after speech stopped;
//! - a response being created or the first assistant output;
//! - upstream's completed transcript.
//!
//! Deltas are fragments of a transcript still being streamed, so they never
//! finalize a turn on their own.

use std::collections::VecDeque;

const REMEMBERED_TURNS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptUpdate {
    /// Text so far for a still-open turn.
    Provisional(String),
    /// The turn's final transcript. Produced once per turn.
    Final(String),
    Ignored,
}

#[derive(Debug, Default)]
pub struct TurnTranscript {
    item_id: Option<String>,
    text: String,
    speech_ended: bool,
    /// The text was built from deltas and may still be incomplete.
    streaming: bool,
    delivered: bool,
    /// Items whose final transcript has already been sent.
    finished_items: VecDeque<String>,
}

impl TurnTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self, item_id: Option<&str>) {
        self.item_id = item_id.map(str::to_owned);
        self.text.clear();
        self.speech_ended = false;
        self.streaming = false;
        self.delivered = false;
    }

    /// Moves to the turn of `item_id` when it differs from the current one.
    fn enter(&mut self, item_id: Option<&str>) {
        let Some(id) = item_id else { return };
        match self.item_id.as_deref() {
            Some(current) if current == id => {}
            Some(_) => self.reset(Some(id)),
            None if self.delivered => self.reset(Some(id)),
            None => self.item_id = Some(id.to_string()),
        }
    }

    fn remember(&mut self) {
        if let Some(id) = &self.item_id {
            if self.finished_items.len() == REMEMBERED_TURNS {
                self.finished_items.pop_front();
            }
            self.finished_items.push_back(id.clone());
        }
    }

    fn is_finished(&self, item_id: &str) -> bool {
        self.finished_items.iter().any(|id| id == item_id)
    }

    pub fn speech_started(&mut self, item_id: Option<&str>) {
        self.reset(item_id);
    }

    pub fn speech_stopped(&mut self, item_id: Option<&str>) -> Option<String> {
        self.enter(item_id);
        self.speech_ended = true;
        if self.streaming {
            return None;
        }
        self.take_final()
    }

    /// A whole-text partial: replaces the turn's text.
    pub fn partial(&mut self, item_id: Option<&str>, transcript: &str) -> TranscriptUpdate {
        self.update(item_id, false, |text| {
            text.clear();
            text.push_str(transcript);
        })
    }

    /// An incremental delta: appends to the turn's text.
    pub fn delta(&mut self, item_id: Option<&str>, delta: &str) -> TranscriptUpdate {
        self.update(item_id, true, |text| text.push_str(delta))
    }

    fn update(
        &mut self,
        item_id: Option<&str>,
        streaming: bool,
        apply: impl FnOnce(&mut String),
    ) -> TranscriptUpdate {
        if item_id.is_some_and(|id| self.is_finished(id)) {
            return TranscriptUpdate::Ignored;
        }
        self.enter(item_id);
        if self.delivered {
            return TranscriptUpdate::Ignored;
        }
        apply(&mut self.text);
        self.streaming = streaming;
        if self.speech_ended && !streaming {
            return match self.take_final() {
                Some(text) => TranscriptUpdate::Final(text),
                None => TranscriptUpdate::Ignored,
            };
        }
        TranscriptUpdate::Provisional(self.text.clone())
    }

    /// Finalizes the open turn if it has any text. Used when the assistant
    /// starts responding.
    pub fn take_final(&mut self) -> Option<String> {
        if self.delivered || self.text.trim().is_empty() {
            return None;
        }
        self.delivered = true;
        self.remember();
        Some(self.text.clone())
    }

    /// Upstream's authoritative transcript for an item. Only delivered if
    /// nothing was delivered for that turn yet.
    pub fn completed(&mut self, item_id: Option<&str>, transcript: &str) -> Option<String> {
        if transcript.trim().is_empty() {
            return None;
        }
        match item_id {
            Some(id) if self.is_finished(id) => None,
            Some(id) if self.item_id.as_deref().is_some_and(|current| current != id) => {
                // A late transcript for an earlier turn that never produced text.
                if self.finished_items.len() == REMEMBERED_TURNS {
                    self.finished_items.pop_front();
                }
                self.finished_items.push_back(id.to_string());
                Some(transcript.to_string())
            }
            _ => {
                self.enter(item_id);
                if self.delivered {
                    return None;
                }
                self.text = transcript.to_string();
                self.take_final()
            }
        }
    }
}
