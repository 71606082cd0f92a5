use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Recently spoken phrases, most recent first, without duplicates.
#[derive(Debug, Clone)]
pub struct PhraseHistory {
    entries: VecDeque<String>,
    limit: usize,
}

impl PhraseHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    /// Rebuild from a persisted list, re-applying dedup and the bound.
    pub fn from_entries(entries: Vec<String>, limit: usize) -> Self {
        let mut history = Self::new(limit);
        for text in entries.into_iter().rev() {
            history.record(&text);
        }
        history
    }

    pub fn record(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.entries.retain(|e| e != text);
        self.entries.push_front(text.to_string());
        self.entries.truncate(self.limit);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PhraseHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
