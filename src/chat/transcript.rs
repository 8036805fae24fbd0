//! Append-only transcript with monotonic message ids.

use crate::models::{ChatMessage, Sender};

/// Ordered message log for one application binding.
///
/// Ids are assigned on append as `counter + 1`. Seeding from persisted
/// history runs the same counter, so ids continue from `history.len()` and a
/// live event can never collide with a historical id. The log is discarded
/// with the binding, never mutated in place.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    counter: u64,
    seeded: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted history. Must happen once, before any live
    /// append; callers hold live events until history load has resolved.
    pub fn seed<I>(&mut self, history: I)
    where
        I: IntoIterator<Item = (String, Sender)>,
    {
        debug_assert!(!self.seeded, "transcript seeded twice");
        debug_assert!(self.messages.is_empty());
        for (text, sender) in history {
            self.counter += 1;
            self.messages.push(ChatMessage {
                id: self.counter,
                text,
                sender,
            });
        }
        self.seeded = true;
    }

    /// Append one live message, returning its id.
    pub fn append(&mut self, text: impl Into<String>, sender: Sender) -> u64 {
        self.counter += 1;
        self.messages.push(ChatMessage {
            id: self.counter,
            text: text.into(),
            sender,
        });
        self.counter
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
