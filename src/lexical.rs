//! In-memory TF-IDF inverted index over memory/rule/entity documents.
//!
//! Maintained incrementally on insert/update/delete and fully rebuildable
//! from persistence via [`LexicalIndex::clear`] followed by re-insertion,
//! exposed at the engine level as `rebuild_index`.

use std::collections::HashMap;

use crate::analyzer::tokenize;

/// A document submitted to the lexical index. Field weights follow the
/// spec's TF-IDF multipliers: tags at 3x, file-path components and
/// category at 1.5x, content/rationale/context at 1x.
#[derive(Debug, Clone, Default)]
pub struct LexicalDocument {
    pub content: String,
    pub rationale: String,
    pub context: String,
    pub tags: Vec<String>,
    pub file_path: Option<String>,
    pub category: String,
}

const TAG_WEIGHT: f64 = 3.0;
const FILE_CATEGORY_WEIGHT: f64 = 1.5;
const BASE_WEIGHT: f64 = 1.0;

fn weighted_terms(doc: &LexicalDocument) -> HashMap<String, f64> {
    let mut weights: HashMap<String, f64> = HashMap::new();
    let mut add = |text: &str, weight: f64, weights: &mut HashMap<String, f64>| {
        for term in tokenize(text) {
            *weights.entry(term).or_insert(0.0) += weight;
        }
    };

    add(&doc.content, BASE_WEIGHT, &mut weights);
    add(&doc.rationale, BASE_WEIGHT, &mut weights);
    add(&doc.context, BASE_WEIGHT, &mut weights);
    for tag in &doc.tags {
        add(tag, TAG_WEIGHT, &mut weights);
    }
    add(&doc.category, FILE_CATEGORY_WEIGHT, &mut weights);
    if let Some(path) = &doc.file_path {
        add(path, FILE_CATEGORY_WEIGHT, &mut weights);
    }
    weights
}

/// An inverted index mapping terms to (document id, term weight) postings,
/// with a parallel document-length table for TF-IDF normalization.
#[derive(Debug, Default)]
pub struct LexicalIndex {
    postings: HashMap<String, HashMap<String, f64>>,
    doc_term_totals: HashMap<String, f64>,
    doc_count: usize,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently indexed.
    pub fn len(&self) -> usize {
        self.doc_count
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }

    /// Insert or replace the document under `id`.
    pub fn upsert(&mut self, id: &str, doc: &LexicalDocument) {
        self.remove(id);
        let weights = weighted_terms(doc);
        let total: f64 = weights.values().sum();
        if total <= 0.0 {
            return;
        }
        for (term, weight) in weights {
            self.postings
                .entry(term)
                .or_default()
                .insert(id.to_string(), weight);
        }
        self.doc_term_totals.insert(id.to_string(), total);
        self.doc_count += 1;
    }

    /// Remove a document from the index. No-op if absent.
    pub fn remove(&mut self, id: &str) {
        if self.doc_term_totals.remove(id).is_none() {
            return;
        }
        self.doc_count = self.doc_count.saturating_sub(1);
        self.postings.retain(|_, docs| {
            docs.remove(id);
            !docs.is_empty()
        });
    }

    /// Drop all documents, returning the index to empty. Callers rebuild by
    /// re-running `upsert` over every persisted document.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.doc_term_totals.clear();
        self.doc_count = 0;
    }

    /// Score `query` against every indexed document using TF-IDF with the
    /// field weighting already baked into the postings, returning the top
    /// `limit` (id, score) pairs sorted descending.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.doc_count == 0 {
            return Vec::new();
        }

        let mut scores: HashMap<String, f64> = HashMap::new();
        for term in &query_terms {
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            // inverse document frequency, smoothed
            let idf = ((self.doc_count as f64 + 1.0) / (docs.len() as f64 + 1.0)).ln() + 1.0;
            for (doc_id, weight) in docs {
                let tf = weight / self.doc_term_totals.get(doc_id).copied().unwrap_or(1.0);
                *scores.entry(doc_id.clone()).or_insert(0.0) += tf * idf;
            }
        }

        let mut results: Vec<(String, f32)> =
            scores.into_iter().map(|(id, s)| (id, s as f32)).collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str, tags: &[&str]) -> LexicalDocument {
        LexicalDocument {
            content: content.to_string(),
            rationale: String::new(),
            context: String::new(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            file_path: None,
            category: "decision".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_search() {
        let mut index = LexicalIndex::new();
        index.upsert("1", &doc("use session cookies for authentication", &[]));
        index.upsert("2", &doc("avoid global mutable state", &[]));

        let results = index.search("session cookies", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "1");
    }

    #[test]
    fn test_remove_drops_from_results() {
        let mut index = LexicalIndex::new();
        index.upsert("1", &doc("session cookies", &[]));
        index.remove("1");
        assert!(index.is_empty());
        assert!(index.search("session cookies", 10).is_empty());
    }

    #[test]
    fn test_tag_weight_boosts_ranking() {
        let mut index = LexicalIndex::new();
        index.upsert("1", &doc("a general note about caching", &[]));
        index.upsert("2", &doc("a general note about something else", &["caching"]));

        let results = index.search("caching", 10);
        assert_eq!(results[0].0, "2");
    }

    #[test]
    fn test_clear_resets_index() {
        let mut index = LexicalIndex::new();
        index.upsert("1", &doc("some content", &[]));
        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.search("content", 10).len(), 0);
    }

    #[test]
    fn test_upsert_replaces_existing_document() {
        let mut index = LexicalIndex::new();
        index.upsert("1", &doc("original content", &[]));
        index.upsert("1", &doc("replaced content entirely", &[]));
        assert_eq!(index.len(), 1);
        assert!(index.search("original", 10).is_empty());
        assert!(!index.search("replaced", 10).is_empty());
    }
}
