use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A compressed memory unit persisted in the keyword index.
///
/// Episodes are immutable once written; the only way to remove one is an
/// explicit management delete by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub content: String,
    /// Where the episode came from, e.g. `summarizer_cycle_003` or the name
    /// of an ingested `.txt` file.
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Episode {
    /// Source tag used when this episode is mirrored into the vector index.
    pub fn chunk_source(&self) -> String {
        format!("episode/{}", self.source)
    }
}

/// Metadata half of a vector-index entry.  The embedding lives in the
/// index's flat vector buffer at the same position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source: String,
    pub text: String,
}

impl Chunk {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }

    pub fn is_lore(&self) -> bool {
        self.source.starts_with("lore/")
    }
}

/// One vector-index result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub source: String,
    pub text: String,
    pub score: f32,
}

impl SearchHit {
    pub fn is_lore(&self) -> bool {
        self.source.starts_with("lore/")
    }
}

/// Outcome of a keyword-index query.
///
/// Callers branch on the variant instead of catching errors: a malformed
/// query is data, not a failure of the store.
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordSearch {
    /// Nothing searchable was left after tokenization.
    Empty,
    /// The full-text engine rejected the query.
    QueryError(String),
    Hits(Vec<Episode>),
}

impl KeywordSearch {
    pub fn into_hits(self) -> Vec<Episode> {
        match self {
            Self::Hits(hits) => hits,
            Self::Empty | Self::QueryError(_) => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Hits(hits) => hits.is_empty(),
            Self::Empty | Self::QueryError(_) => true,
        }
    }
}

/// Truncate `s` to at most `max_chars` Unicode scalar values, returning a
/// sub-slice.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Shorten `s` for prompt display: cut at the last word boundary before
/// `max_chars` and append `...`.  Text that already fits is returned as-is.
pub fn truncate_for_display(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head = truncate_str(s, max_chars);
    let cut = match head.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => &head[..idx],
        _ => head,
    };
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "hé");
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[test]
    fn display_truncation_cuts_on_word_boundary() {
        let text = "we walked along the river until the lights came on";
        let short = truncate_for_display(text, 20);
        assert_eq!(short, "we walked along the...");
        assert_eq!(truncate_for_display("short", 20), "short");
    }

    #[test]
    fn display_truncation_without_spaces_cuts_hard() {
        let short = truncate_for_display("abcdefghijklmnop", 5);
        assert_eq!(short, "abcde...");
    }

    #[test]
    fn keyword_search_variants_collapse_to_hits() {
        assert!(KeywordSearch::Empty.into_hits().is_empty());
        assert!(KeywordSearch::QueryError("syntax".into()).is_empty());
        let ep = Episode {
            id: 1,
            content: "x".into(),
            source: "s".into(),
            created_at: Utc::now(),
        };
        assert_eq!(KeywordSearch::Hits(vec![ep.clone()]).into_hits(), vec![ep]);
    }

    #[test]
    fn lore_detection_uses_source_prefix() {
        assert!(Chunk::new("lore/self", "x").is_lore());
        assert!(!Chunk::new("semantic/memory", "x").is_lore());
        assert!(!Chunk::new("episode/lore", "x").is_lore());
    }
}
