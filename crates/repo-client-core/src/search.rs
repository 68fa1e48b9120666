//! In-memory inverted index with per-field boosts.
//!
//! The index is built once from a slice of [`Indexable`] documents and is
//! never updated incrementally; callers rebuild it when the underlying
//! collection changes.
//!
//! # Scoring
//!
//! For every query term, each indexed term that matches it contributes
//!
//! ```text
//! boost(field) × (1 + ln tf) × idf(term) × match_weight
//! ```
//!
//! to the documents in its postings, where `match_weight` is `1.0` for an
//! exact match, [`PREFIX_WEIGHT`] for a prefix match, and
//! [`FUZZY_WEIGHT`]` / distance` for a fuzzy match. Per-document totals are
//! multiplied by the number of distinct query terms that matched, so
//! documents covering more of the query rank first.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use serde::{Deserialize, Serialize};

/// Weight of a prefix (but not exact) term match.
pub const PREFIX_WEIGHT: f64 = 0.4;
/// Weight of a fuzzy match at edit distance 1; divided by the distance.
pub const FUZZY_WEIGHT: f64 = 0.3;

/// A document that exposes text for named fields.
pub trait Indexable {
    /// Returns the text of `field`, or `None` when the document lacks it.
    fn field_text(&self, field: &str) -> Option<Cow<'_, str>>;
}

/// A field to index and its score multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub boost: f64,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, boost: f64) -> Self {
        Self {
            name: name.into(),
            boost,
        }
    }
}

/// Default post fields: title, tags, and excerpt weigh more than body text.
pub fn default_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("title", 3.0),
        FieldSpec::new("content", 1.0),
        FieldSpec::new("excerpt", 1.5),
        FieldSpec::new("tags", 2.0),
        FieldSpec::new("plain", 1.0),
    ]
}

/// Matching behavior for a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Let query terms match indexed terms they are a prefix of.
    pub prefix: bool,
    /// Maximum edit distance as a fraction of the query term length
    /// (`0.0` disables fuzzy matching).
    pub fuzzy: f64,
    /// Maximum number of hits (`None` = all).
    pub limit: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            prefix: true,
            fuzzy: 0.2,
            limit: None,
        }
    }
}

/// A scored document returned by [`InvertedIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Position of the document in the slice the index was built from.
    pub doc: usize,
    pub score: f64,
    /// Query terms that matched this document.
    pub terms: Vec<String>,
    /// Indexed terms that produced the matches.
    pub matched: Vec<String>,
}

#[derive(Debug, Clone)]
struct Posting {
    doc: usize,
    field: usize,
    tf: u32,
}

/// Inverted index over a fixed set of documents.
#[derive(Debug, Clone, Default)]
pub struct InvertedIndex {
    fields: Vec<FieldSpec>,
    terms: BTreeMap<String, Vec<Posting>>,
    doc_count: usize,
}

/// Lowercase `text` and split it into alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl InvertedIndex {
    /// Index `docs` over `fields`. Documents missing a field are skipped
    /// for that field only.
    pub fn build<D: Indexable>(fields: Vec<FieldSpec>, docs: &[D]) -> Self {
        let mut terms: BTreeMap<String, Vec<Posting>> = BTreeMap::new();

        for (doc, item) in docs.iter().enumerate() {
            for (field, spec) in fields.iter().enumerate() {
                let Some(text) = item.field_text(&spec.name) else {
                    continue;
                };
                let mut counts: HashMap<String, u32> = HashMap::new();
                for token in tokenize(&text) {
                    *counts.entry(token).or_insert(0) += 1;
                }
                for (term, tf) in counts {
                    terms.entry(term).or_default().push(Posting { doc, field, tf });
                }
            }
        }

        Self {
            fields,
            terms,
            doc_count: docs.len(),
        }
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.doc_count
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }

    /// Number of distinct indexed terms.
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn idf(&self, postings: &[Posting]) -> f64 {
        let df = postings
            .iter()
            .map(|p| p.doc)
            .collect::<HashSet<_>>()
            .len() as f64;
        let n = self.doc_count as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Indexed terms matching `query_term`, with their match weights.
    fn expand(&self, query_term: &str, opts: &QueryOptions) -> Vec<(&str, f64)> {
        let mut weights: HashMap<&str, f64> = HashMap::new();

        if let Some((term, _)) = self.terms.get_key_value(query_term) {
            weights.insert(term.as_str(), 1.0);
        }

        if opts.prefix {
            let from = (Bound::Included(query_term), Bound::Unbounded);
            for (term, _) in self.terms.range::<str, _>(from) {
                if !term.starts_with(query_term) {
                    break;
                }
                let w = weights.entry(term.as_str()).or_insert(0.0);
                *w = w.max(PREFIX_WEIGHT);
            }
        }

        let query_len = query_term.chars().count();
        let max_distance = (query_len as f64 * opts.fuzzy).round() as usize;
        if max_distance > 0 {
            for term in self.terms.keys() {
                let term_len = term.chars().count();
                if term_len.abs_diff(query_len) > max_distance {
                    continue;
                }
                let distance = strsim::levenshtein(query_term, term);
                if distance == 0 || distance > max_distance {
                    continue;
                }
                let w = weights.entry(term.as_str()).or_insert(0.0);
                *w = w.max(FUZZY_WEIGHT / distance as f64);
            }
        }

        weights.into_iter().collect()
    }

    /// Rank documents against `query`. Results are sorted by descending
    /// score, ties broken by document position.
    pub fn search(&self, query: &str, opts: &QueryOptions) -> Vec<SearchHit> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        struct Acc {
            score: f64,
            terms: Vec<String>,
            matched: Vec<String>,
        }

        let mut acc: HashMap<usize, Acc> = HashMap::new();

        for query_term in &query_terms {
            for (term, weight) in self.expand(query_term, opts) {
                let Some(postings) = self.terms.get(term) else {
                    continue;
                };
                let idf = self.idf(postings);
                for posting in postings {
                    let boost = self.fields[posting.field].boost;
                    let tf = 1.0 + (posting.tf as f64).ln();
                    let entry = acc.entry(posting.doc).or_insert_with(|| Acc {
                        score: 0.0,
                        terms: Vec::new(),
                        matched: Vec::new(),
                    });
                    entry.score += boost * tf * idf * weight;
                    if !entry.terms.contains(query_term) {
                        entry.terms.push(query_term.clone());
                    }
                    if !entry.matched.iter().any(|m| m == term) {
                        entry.matched.push(term.to_string());
                    }
                }
            }
        }

        let mut hits: Vec<SearchHit> = acc
            .into_iter()
            .map(|(doc, a)| SearchHit {
                doc,
                score: a.score * a.terms.len() as f64,
                terms: a.terms,
                matched: a.matched,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.doc.cmp(&b.doc))
        });

        if let Some(limit) = opts.limit {
            hits.truncate(limit);
        }
        hits
    }

    /// Suggest indexed terms that start with `term`.
    ///
    /// Runs a prefix + fuzzy search, keeps matched terms that literally
    /// start with the lowercased input, and orders them exact match first,
    /// then by length, then alphabetically.
    pub fn autocomplete(&self, term: &str, limit: usize, fuzzy: f64) -> Vec<String> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Vec::new();
        }

        let opts = QueryOptions {
            prefix: true,
            fuzzy,
            limit: None,
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut suggestions: Vec<String> = self
            .search(&needle, &opts)
            .into_iter()
            .flat_map(|hit| hit.matched)
            .filter(|m| m.starts_with(&needle))
            .filter(|m| seen.insert(m.clone()))
            .collect();

        suggestions.sort_by(|a, b| {
            let a_exact = *a == needle;
            let b_exact = *b == needle;
            b_exact
                .cmp(&a_exact)
                .then(a.len().cmp(&b.len()))
                .then(a.cmp(b))
        });
        suggestions.truncate(limit);
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doc {
        title: &'static str,
        content: &'static str,
    }

    impl Indexable for Doc {
        fn field_text(&self, field: &str) -> Option<Cow<'_, str>> {
            match field {
                "title" => Some(Cow::Borrowed(self.title)),
                "content" => Some(Cow::Borrowed(self.content)),
                _ => None,
            }
        }
    }

    fn fixture() -> InvertedIndex {
        let docs = vec![
            Doc {
                title: "Gardening notes",
                content: "Tomatoes need a trellis and plenty of sun",
            },
            Doc {
                title: "Trellis building",
                content: "Cut the cedar boards to length",
            },
            Doc {
                title: "Cooking",
                content: "Slow roasted tomatoes with garlic",
            },
        ];
        InvertedIndex::build(
            vec![FieldSpec::new("title", 3.0), FieldSpec::new("content", 1.0)],
            &docs,
        )
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Hello, World! rust-lang 2024"),
            vec!["hello", "world", "rust", "lang", "2024"]
        );
        assert!(tokenize("  ... ").is_empty());
    }

    #[test]
    fn test_title_boost_outranks_content() {
        let index = fixture();
        let hits = index.search("trellis", &QueryOptions::default());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc, 1, "title match should rank first");
        assert_eq!(hits[1].doc, 0);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_prefix_match() {
        let index = fixture();
        let opts = QueryOptions {
            prefix: true,
            fuzzy: 0.0,
            limit: None,
        };
        let hits = index.search("tomat", &opts);
        let docs: HashSet<usize> = hits.iter().map(|h| h.doc).collect();
        assert_eq!(docs, HashSet::from([0, 2]));

        let exact_only = QueryOptions {
            prefix: false,
            ..opts
        };
        assert!(index.search("tomat", &exact_only).is_empty());
    }

    #[test]
    fn test_fuzzy_match() {
        let index = fixture();
        let opts = QueryOptions {
            prefix: false,
            fuzzy: 0.2,
            limit: None,
        };
        let hits = index.search("garlik", &opts);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc, 2);
        assert_eq!(hits[0].matched, vec!["garlic".to_string()]);
    }

    #[test]
    fn test_limit() {
        let index = fixture();
        let opts = QueryOptions {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(index.search("tomatoes", &opts).len(), 1);
    }

    #[test]
    fn test_empty_query() {
        let index = fixture();
        assert!(index.search("   ", &QueryOptions::default()).is_empty());
    }

    #[test]
    fn test_autocomplete_ordering() {
        struct Tags(&'static str);
        impl Indexable for Tags {
            fn field_text(&self, _field: &str) -> Option<Cow<'_, str>> {
                Some(Cow::Borrowed(self.0))
            }
        }
        let docs = vec![
            Tags("rustacean"),
            Tags("rusty tools"),
            Tags("rust"),
            Tags("trust"),
        ];
        let index = InvertedIndex::build(vec![FieldSpec::new("body", 1.0)], &docs);

        let suggestions = index.autocomplete("Rust", 10, 0.2);
        assert_eq!(suggestions, vec!["rust", "rusty", "rustacean"]);

        assert_eq!(index.autocomplete("rust", 2, 0.2).len(), 2);
        assert!(index.autocomplete("", 5, 0.2).is_empty());
    }
}
