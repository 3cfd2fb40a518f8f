//! Fuzzy search index over folder and file display names.
//!
//! A flat secondary index maintained incrementally by every metadata
//! mutation and rebuilt wholesale after a persistence restore. Matching is
//! approximate: case-insensitive substring hits rank highest, everything
//! else is scored by bigram overlap, and candidates below the similarity
//! floor are dropped (names roughly 30% dissimilar still match).

use std::collections::HashSet;

/// Which record map an index entry points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    File,
    Folder,
}

#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub kind: RecordKind,
    pub id: String,
    pub text: String,
}

/// Minimum similarity for a candidate to be returned at all.
const SCORE_FLOOR: f64 = 0.3;

#[derive(Debug, Default)]
pub struct SearchIndex {
    entries: Vec<SearchEntry>,
}

impl SearchIndex {
    pub fn new() -> Self {
        SearchIndex::default()
    }

    /// Insert or replace the entry for `(kind, id)`. Renames re-add under
    /// the same id, so this must overwrite rather than accumulate.
    pub fn add(&mut self, kind: RecordKind, id: &str, text: &str) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.kind == kind && e.id == id)
        {
            existing.text = text.to_string();
            return;
        }
        self.entries.push(SearchEntry {
            kind,
            id: id.to_string(),
            text: text.to_string(),
        });
    }

    /// Drop the entry for `(kind, id)`, if present.
    pub fn remove(&mut self, kind: RecordKind, id: &str) {
        self.entries.retain(|e| !(e.kind == kind && e.id == id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ranked candidates above the similarity floor, best first. Ties keep
    /// insertion order (stable sort).
    pub fn search(&self, query: &str, max: usize) -> Vec<&SearchEntry> {
        if query.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(f64, &SearchEntry)> = self
            .entries
            .iter()
            .filter_map(|e| {
                let score = similarity(query, &e.text);
                (score > SCORE_FLOOR).then_some((score, e))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(max).map(|(_, e)| e).collect()
    }
}

/// Similarity in `[0, 1]`. Substring containment scores by length ratio
/// (biased high so short queries still surface long names); otherwise the
/// Dice coefficient over character bigrams.
fn similarity(query: &str, text: &str) -> f64 {
    let q = query.to_lowercase();
    let t = text.to_lowercase();
    // An empty name (location roots) would otherwise "contain" any query
    if t.is_empty() {
        return 0.0;
    }
    if q == t {
        return 1.0;
    }
    let (shorter, longer) = if q.len() <= t.len() { (&q, &t) } else { (&t, &q) };
    if longer.contains(shorter.as_str()) {
        let ratio = shorter.chars().count() as f64 / longer.chars().count() as f64;
        return 0.5 + 0.5 * ratio;
    }
    bigram_dice(&q, &t)
}

fn bigram_dice(a: &str, b: &str) -> f64 {
    let ga = bigrams(a);
    let gb = bigrams(b);
    if ga.is_empty() || gb.is_empty() {
        return 0.0;
    }
    let overlap = ga.intersection(&gb).count();
    2.0 * overlap as f64 / (ga.len() + gb.len()) as f64
}

fn bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}
