//! Boolean filter for documentation search.
//!
//! The grammar is flat: a query uses at most one kind of
//! operator, checked in the order `and`, `or`, `not`. `a and b or c` is read
//! as an AND of `a` and `b or c`, with `b or c` matched as a literal phrase.
//! Operands are case-insensitive substrings of a document's title + content.

use crate::error::SearchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BooleanQuery {
    /// No operator: every document passes the filter.
    Plain(String),
    All(Vec<String>),
    Any(Vec<String>),
    Not { include: Option<String>, exclude: String },
}

impl BooleanQuery {
    pub fn parse(query: &str) -> Result<Self, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let words: Vec<&str> = query.split_whitespace().collect();

        for op in ["and", "or"] {
            if words.iter().any(|w| w.eq_ignore_ascii_case(op)) {
                let operands = split_on(&words, op);
                if operands.iter().any(|o| o.is_empty()) {
                    return Err(SearchError::MalformedQuery(format!(
                        "'{}' needs a term on both sides",
                        op.to_uppercase()
                    )));
                }
                return Ok(if op == "and" {
                    BooleanQuery::All(operands)
                } else {
                    BooleanQuery::Any(operands)
                });
            }
        }

        if let Some(pos) = words.iter().position(|w| w.eq_ignore_ascii_case("not")) {
            let include = words[..pos].join(" ").to_lowercase();
            let exclude = words[pos + 1..].join(" ").to_lowercase();
            if exclude.is_empty() {
                return Err(SearchError::MalformedQuery(
                    "'NOT' needs a term after it".to_string(),
                ));
            }
            return Ok(BooleanQuery::Not {
                include: (!include.is_empty()).then_some(include),
                exclude,
            });
        }

        Ok(BooleanQuery::Plain(query.to_string()))
    }

    pub fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        match self {
            BooleanQuery::Plain(_) => true,
            BooleanQuery::All(terms) => terms.iter().all(|t| text.contains(t.as_str())),
            BooleanQuery::Any(terms) => terms.iter().any(|t| text.contains(t.as_str())),
            BooleanQuery::Not { include, exclude } => {
                include.as_ref().map_or(true, |t| text.contains(t.as_str()))
                    && !text.contains(exclude.as_str())
            }
        }
    }

    /// Terms a hit is expected to contain, used for highlighting.
    pub fn positive_terms(&self) -> Vec<String> {
        match self {
            BooleanQuery::Plain(q) => q.split_whitespace().map(|w| w.to_lowercase()).collect(),
            BooleanQuery::All(terms) | BooleanQuery::Any(terms) => terms.clone(),
            BooleanQuery::Not { include, .. } => include.iter().cloned().collect(),
        }
    }

    /// Text to embed for the similarity pass. Excluded terms are left out.
    pub fn semantic_text(&self, original: &str) -> String {
        let terms = self.positive_terms();
        if terms.is_empty() {
            original.trim().to_string()
        } else {
            terms.join(" ")
        }
    }
}

fn split_on(words: &[&str], op: &str) -> Vec<String> {
    words
        .split(|w| w.eq_ignore_ascii_case(op))
        .map(|part| part.join(" ").to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_priority() {
        assert_eq!(
            BooleanQuery::parse("async AND tokio").unwrap(),
            BooleanQuery::All(vec!["async".into(), "tokio".into()])
        );
        assert_eq!(
            BooleanQuery::parse("a and b or c").unwrap(),
            BooleanQuery::All(vec!["a".into(), "b or c".into()])
        );
        assert_eq!(
            BooleanQuery::parse("hooks or effects").unwrap(),
            BooleanQuery::Any(vec!["hooks".into(), "effects".into()])
        );
        assert_eq!(
            BooleanQuery::parse("routing not legacy").unwrap(),
            BooleanQuery::Not {
                include: Some("routing".into()),
                exclude: "legacy".into()
            }
        );
    }

    #[test]
    fn test_matches() {
        let q = BooleanQuery::parse("routing not legacy").unwrap();
        assert!(q.matches("New Routing API"));
        assert!(!q.matches("Legacy routing"));
        assert!(BooleanQuery::parse("state or props").unwrap().matches("Props drilling"));
        assert!(BooleanQuery::parse("anything").unwrap().matches("unrelated"));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            BooleanQuery::parse("a and"),
            Err(SearchError::MalformedQuery(_))
        ));
        assert!(matches!(
            BooleanQuery::parse("x not"),
            Err(SearchError::MalformedQuery(_))
        ));
        assert!(matches!(BooleanQuery::parse("  "), Err(SearchError::EmptyQuery)));
    }
}
