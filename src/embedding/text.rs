//! Entity → text conversion for embedding, plus the content hash used to
//! detect stale vectors.

use sha2::{Digest, Sha256};

use crate::models::{Component, Note, Rule, Task};

/// Snippets longer than this are cut before embedding.
const MAX_SNIPPET_CHARS: usize = 2000;

pub fn component_text(c: &Component) -> String {
    let mut text = format!(
        "{} {} ({}) in {}",
        c.component_type.as_str(),
        c.name,
        c.language,
        c.file_path
    );
    if let Some(snippet) = c.code_snippet.as_deref() {
        text.push('\n');
        text.extend(snippet.chars().take(MAX_SNIPPET_CHARS));
    }
    text
}

pub fn task_text(t: &Task) -> String {
    let mut text = format!("Task: {}\n{}", t.title, t.description);
    push_tags(&mut text, &t.tags);
    text
}

pub fn note_text(n: &Note) -> String {
    let mut text = format!("Note: {}\n{}", n.title, n.content);
    push_tags(&mut text, &n.tags);
    text
}

pub fn rule_text(r: &Rule) -> String {
    let mut text = format!("Rule: {}\n{}\n{}", r.name, r.description, r.guidance);
    if !r.trigger_patterns.is_empty() {
        text.push_str("\nApplies to: ");
        text.push_str(&r.trigger_patterns.join(", "));
    }
    push_tags(&mut text, &r.tags);
    text
}

fn push_tags(text: &mut String, tags: &[String]) {
    if !tags.is_empty() {
        text.push_str("\nTags: ");
        text.push_str(&tags.join(", "));
    }
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentType, SourceSpan};

    #[test]
    fn test_component_text_truncates_snippet() {
        let c = Component {
            id: "x".into(),
            name: "Parser".into(),
            component_type: ComponentType::Struct,
            language: "rust".into(),
            file_path: "src/parser.rs".into(),
            span: SourceSpan::default(),
            code_snippet: Some("a".repeat(5000)),
            metadata: serde_json::Value::Null,
        };
        let text = component_text(&c);
        assert!(text.starts_with("struct Parser (rust) in src/parser.rs\n"));
        assert!(text.len() < 2100);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }
}
