//! Concept index: inverted postings, concept token → frame ids.
//!
//! Tokens are trimmed and lowercased; empty tokens are ignored.

use std::collections::{BTreeSet, HashMap};

use crate::frame::FrameId;

pub fn normalize_token(token: &str) -> Option<String> {
    let t = token.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_lowercase())
    }
}

#[derive(Debug, Default)]
pub struct ConceptIndex {
    postings: HashMap<String, BTreeSet<FrameId>>,
    by_frame: HashMap<FrameId, Vec<String>>,
}

impl ConceptIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the concept set of `id`.
    pub fn set(&mut self, id: FrameId, concepts: &[String]) {
        self.remove(id);
        let mut tokens: Vec<String> = concepts.iter().filter_map(|c| normalize_token(c)).collect();
        tokens.sort();
        tokens.dedup();
        if tokens.is_empty() {
            return;
        }
        for token in &tokens {
            self.postings.entry(token.clone()).or_default().insert(id);
        }
        self.by_frame.insert(id, tokens);
    }

    pub fn remove(&mut self, id: FrameId) {
        let Some(tokens) = self.by_frame.remove(&id) else {
            return;
        };
        for token in tokens {
            if let Some(ids) = self.postings.get_mut(&token) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }

    /// Frames annotated with `token`, ascending id.
    pub fn lookup(&self, token: &str) -> Vec<FrameId> {
        normalize_token(token)
            .and_then(|t| self.postings.get(&t))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn token_count(&self) -> usize {
        self.postings.len()
    }
}
