//! Text analysis: tokenization, code-symbol splitting, and tag inference.
//!
//! Shared by the lexical index (§C), the rule engine (§I), and the code
//! indexer's `find_code` document construction.

use std::collections::HashSet;

/// A fixed English stopword list. Tokens here are dropped from the analyzed
/// keyword set but remain in the raw text used for vector embedding.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has",
    "have", "he", "in", "is", "it", "its", "of", "on", "or", "that", "the",
    "this", "to", "was", "were", "will", "with", "we", "you", "your", "i",
    "but", "not", "can", "do", "does", "did", "if", "then", "so", "than",
];

/// Output of running the analyzer over a piece of text: the full token
/// stream (used for embedding) and the deduplicated keyword set with
/// stopwords removed (used for lexical indexing and rule matching).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    /// Every lowercased token, including stopwords and code-symbol parts.
    pub tokens: Vec<String>,
    /// Stopword-filtered, deduplicated keyword set.
    pub keywords: HashSet<String>,
}

/// Tokenize `text`, lowercasing and splitting identifiers that look like
/// CamelCase or snake_case into constituent parts. Both the whole
/// identifier and its parts are emitted.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if raw.is_empty() {
            continue;
        }
        let lower = raw.to_lowercase();
        tokens.push(lower);
        for part in split_identifier(raw) {
            let part_lower = part.to_lowercase();
            if part_lower != raw.to_lowercase() && part_lower.len() > 1 {
                tokens.push(part_lower);
            }
        }
    }
    tokens
}

/// Split a single identifier on snake_case underscores and CamelCase word
/// boundaries. Returns the constituent parts only (not the whole word).
fn split_identifier(identifier: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for segment in identifier.split('_') {
        if segment.is_empty() {
            continue;
        }
        let mut current = String::new();
        let chars: Vec<char> = segment.chars().collect();
        for (i, &c) in chars.iter().enumerate() {
            let starts_new_word = i > 0
                && c.is_uppercase()
                && (chars[i - 1].is_lowercase()
                    || (i + 1 < chars.len()
                        && chars[i - 1].is_uppercase()
                        && chars[i + 1].is_lowercase()));
            if starts_new_word && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            current.push(c);
        }
        if !current.is_empty() {
            parts.push(current);
        }
    }
    if identifier.contains('_') {
        parts
    } else if parts.len() > 1 {
        parts
    } else {
        Vec::new()
    }
}

/// Run the full analysis pipeline: tokenize then remove stopwords to
/// produce the keyword set.
pub fn analyze(text: &str) -> Analysis {
    let tokens = tokenize(text);
    let keywords = tokens
        .iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()) && t.len() > 1)
        .cloned()
        .collect();
    Analysis { tokens, keywords }
}

/// Tag-inference rule: content containing any of `triggers` implies `tag`.
struct TagRule {
    triggers: &'static [&'static str],
    tag: &'static str,
}

const TAG_RULES: &[TagRule] = &[
    TagRule {
        triggers: &["fix", "bug", "error", "broken", "crash"],
        tag: "bugfix",
    },
    TagRule {
        triggers: &["todo", "hack", "workaround", "temporary"],
        tag: "tech-debt",
    },
    TagRule {
        triggers: &["cache", "slow", "fast", "performance", "optimize"],
        tag: "perf",
    },
];

/// Infer tags from `content` and `category`, appending to (never replacing)
/// `existing_tags`. `category` is a lowercase category name; `"warning"`
/// always contributes the `warning` tag.
pub fn infer_tags(content: &str, category: &str, existing_tags: &[String]) -> Vec<String> {
    let lower = content.to_lowercase();
    let mut tags: Vec<String> = existing_tags.to_vec();
    let mut seen: HashSet<String> = tags.iter().cloned().collect();

    let mut push = |tag: &str, tags: &mut Vec<String>, seen: &mut HashSet<String>| {
        if seen.insert(tag.to_string()) {
            tags.push(tag.to_string());
        }
    };

    for rule in TAG_RULES {
        if rule.triggers.iter().any(|t| lower.contains(t)) {
            push(rule.tag, &mut tags, &mut seen);
        }
    }
    if category.eq_ignore_ascii_case("warning") {
        push("warning", &mut tags, &mut seen);
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases() {
        let tokens = tokenize("Hello World");
        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"world".to_string()));
    }

    #[test]
    fn test_tokenize_splits_camel_case() {
        let tokens = tokenize("UserService");
        assert!(tokens.contains(&"userservice".to_string()));
        assert!(tokens.contains(&"user".to_string()));
        assert!(tokens.contains(&"service".to_string()));
    }

    #[test]
    fn test_tokenize_splits_snake_case() {
        let tokens = tokenize("get_user_by_id");
        assert!(tokens.contains(&"get".to_string()));
        assert!(tokens.contains(&"user".to_string()));
        assert!(tokens.contains(&"by".to_string()));
        assert!(tokens.contains(&"id".to_string()));
    }

    #[test]
    fn test_analyze_removes_stopwords() {
        let analysis = analyze("this is a test of the analyzer");
        assert!(!analysis.keywords.contains("this"));
        assert!(!analysis.keywords.contains("the"));
        assert!(analysis.keywords.contains("test"));
        assert!(analysis.keywords.contains("analyzer"));
        // raw tokens still keep stopwords for embedding input
        assert!(analysis.tokens.contains(&"this".to_string()));
    }

    #[test]
    fn test_infer_tags_bugfix() {
        let tags = infer_tags("fixed a crash in the parser", "decision", &[]);
        assert!(tags.contains(&"bugfix".to_string()));
    }

    #[test]
    fn test_infer_tags_warning_category() {
        let tags = infer_tags("avoid this pattern", "warning", &[]);
        assert!(tags.contains(&"warning".to_string()));
    }

    #[test]
    fn test_infer_tags_appends_not_replaces() {
        let existing = vec!["custom".to_string()];
        let tags = infer_tags("slow cache lookup", "learning", &existing);
        assert!(tags.contains(&"custom".to_string()));
        assert!(tags.contains(&"perf".to_string()));
    }

    #[test]
    fn test_infer_tags_no_duplicate() {
        let existing = vec!["perf".to_string()];
        let tags = infer_tags("this is slow", "learning", &existing);
        assert_eq!(tags.iter().filter(|t| *t == "perf").count(), 1);
    }
}
