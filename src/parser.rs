//! Parser contract and per-extension registry.
//!
//! A [`SourceParser`] turns one file's text into components and candidate
//! relationships. Parsers are black boxes to the indexer: it only looks at
//! the [`ParseOutput`]. A file with no registered parser is reported as a
//! per-file `no_parser` error.
//!
//! [`OutlineParser`] is the built-in parser. It recognizes top-level
//! declarations line by line for a handful of languages; anything more
//! precise plugs in through [`ParserRegistry::register`].

use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::models::{Component, ComponentType, Relationship, RelationshipType, SourceSpan};

/// What a parser returns for one file.
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub components: Vec<Component>,
    pub relationships: Vec<Relationship>,
    /// Non-empty means the parse failed; the file is not written.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub trait SourceParser: Send + Sync {
    /// Language name stored on each component.
    fn language(&self) -> &str;

    /// File extensions (without the dot) this parser handles.
    fn extensions(&self) -> Vec<String>;

    /// Parse `content`. `path` is the project-relative path used in component ids.
    fn parse(&self, path: &str, content: &str) -> Result<ParseOutput>;
}

/// Extension → parser lookup.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    by_extension: HashMap<String, Arc<dyn SourceParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an [`OutlineParser`] for each built-in language.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for lang in OutlineLanguage::ALL {
            registry.register(Arc::new(OutlineParser::new(lang)));
        }
        registry
    }

    /// Register `parser` for all its extensions, replacing earlier registrations.
    pub fn register(&mut self, parser: Arc<dyn SourceParser>) {
        for ext in parser.extensions() {
            self.by_extension
                .insert(ext.trim_start_matches('.').to_lowercase(), Arc::clone(&parser));
        }
    }

    pub fn for_path(&self, path: &Path) -> Option<Arc<dyn SourceParser>> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.by_extension.get(&ext).cloned()
    }

    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.by_extension.keys().cloned().collect();
        exts.sort();
        exts
    }
}

// ============ Built-in outline parser ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlineLanguage {
    Rust,
    Python,
    TypeScript,
    JavaScript,
    Java,
    Go,
}

impl OutlineLanguage {
    pub const ALL: [OutlineLanguage; 6] = [
        OutlineLanguage::Rust,
        OutlineLanguage::Python,
        OutlineLanguage::TypeScript,
        OutlineLanguage::JavaScript,
        OutlineLanguage::Java,
        OutlineLanguage::Go,
    ];

    fn name(&self) -> &'static str {
        match self {
            OutlineLanguage::Rust => "rust",
            OutlineLanguage::Python => "python",
            OutlineLanguage::TypeScript => "typescript",
            OutlineLanguage::JavaScript => "javascript",
            OutlineLanguage::Java => "java",
            OutlineLanguage::Go => "go",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            OutlineLanguage::Rust => &["rs"],
            OutlineLanguage::Python => &["py"],
            OutlineLanguage::TypeScript => &["ts", "tsx"],
            OutlineLanguage::JavaScript => &["js", "jsx", "mjs"],
            OutlineLanguage::Java => &["java"],
            OutlineLanguage::Go => &["go"],
        }
    }

    /// Keyword prefixes that introduce a declaration, with the type they produce.
    fn declarations(&self) -> &'static [(&'static str, ComponentType)] {
        match self {
            OutlineLanguage::Rust => &[
                ("struct ", ComponentType::Struct),
                ("enum ", ComponentType::Enum),
                ("trait ", ComponentType::Trait),
                ("fn ", ComponentType::Function),
                ("mod ", ComponentType::Module),
                ("const ", ComponentType::Constant),
            ],
            OutlineLanguage::Python => &[
                ("class ", ComponentType::Class),
                ("def ", ComponentType::Function),
                ("async def ", ComponentType::Function),
            ],
            OutlineLanguage::TypeScript | OutlineLanguage::JavaScript => &[
                ("class ", ComponentType::Class),
                ("abstract class ", ComponentType::Class),
                ("interface ", ComponentType::Interface),
                ("enum ", ComponentType::Enum),
                ("function ", ComponentType::Function),
                ("async function ", ComponentType::Function),
            ],
            OutlineLanguage::Java => &[
                ("class ", ComponentType::Class),
                ("abstract class ", ComponentType::Class),
                ("final class ", ComponentType::Class),
                ("interface ", ComponentType::Interface),
                ("enum ", ComponentType::Enum),
            ],
            OutlineLanguage::Go => &[("func ", ComponentType::Function), ("type ", ComponentType::Struct)],
        }
    }

    /// Leading modifiers stripped before matching a declaration keyword.
    fn modifiers(&self) -> &'static [&'static str] {
        match self {
            OutlineLanguage::Rust => &["pub(crate) ", "pub(super) ", "pub ", "async ", "unsafe "],
            OutlineLanguage::Python => &[],
            OutlineLanguage::TypeScript | OutlineLanguage::JavaScript => &["export default ", "export ", "declare "],
            OutlineLanguage::Java => &["public ", "protected ", "private ", "static "],
            OutlineLanguage::Go => &[],
        }
    }
}

/// Line-based declaration scanner.
///
/// Emits a `file` component for the file, one component per top-level
/// declaration (`<path>#<name>`), a `contains` edge from the file to each,
/// and `extends`/`implements` edges when both ends are declared in the
/// same file. Unbalanced braces are reported as a parse error.
pub struct OutlineParser {
    lang: OutlineLanguage,
}

impl OutlineParser {
    pub fn new(lang: OutlineLanguage) -> Self {
        Self { lang }
    }

    fn strip_modifiers<'a>(&self, mut line: &'a str) -> &'a str {
        loop {
            let before = line;
            for m in self.lang.modifiers() {
                if let Some(rest) = line.strip_prefix(m) {
                    line = rest;
                }
            }
            if before.len() == line.len() {
                return line;
            }
        }
    }

    /// Receiver type for a Go method (`func (s *Server) Start()` → `Server`).
    fn go_receiver(rest: &str) -> Option<(&str, &str)> {
        let rest = rest.strip_prefix('(')?;
        let close = rest.find(')')?;
        let receiver = rest[..close].split_whitespace().last()?.trim_start_matches('*');
        Some((receiver, rest[close + 1..].trim_start()))
    }
}

fn ident(s: &str) -> &str {
    let end = s
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    &s[..end]
}

/// Names following `keyword` in `line`, split on commas (`implements A, B`).
fn names_after<'a>(line: &'a str, keyword: &str) -> Vec<&'a str> {
    let Some(pos) = line.find(keyword) else {
        return Vec::new();
    };
    let tail = &line[pos + keyword.len()..];
    let tail = tail.split(['{', ':']).next().unwrap_or("");
    tail.split(',')
        .map(|part| ident(part.trim()))
        .filter(|n| !n.is_empty())
        .collect()
}

impl SourceParser for OutlineParser {
    fn language(&self) -> &str {
        self.lang.name()
    }

    fn extensions(&self) -> Vec<String> {
        self.lang.extensions().iter().map(|e| e.to_string()).collect()
    }

    fn parse(&self, path: &str, content: &str) -> Result<ParseOutput> {
        let mut out = ParseOutput::default();
        let total_lines = content.lines().count().max(1) as u32;
        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);

        out.components.push(Component {
            id: path.to_string(),
            name: file_name.to_string(),
            component_type: ComponentType::File,
            language: self.lang.name().to_string(),
            file_path: path.to_string(),
            span: SourceSpan::lines(1, total_lines),
            code_snippet: None,
            metadata: serde_json::json!({}),
        });

        // (child name, parent name, relationship) resolved after all declarations are known.
        let mut pending_edges: Vec<(String, String, RelationshipType)> = Vec::new();
        let mut depth: i64 = 0;
        let mut declared: Vec<(String, usize)> = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx as u32 + 1;
            let indent = raw.len() - raw.trim_start().len();
            let trimmed = raw.trim();
            let top_level = match self.lang {
                OutlineLanguage::Python => indent == 0,
                _ => depth == 0,
            };

            if top_level && !trimmed.is_empty() {
                let line = self.strip_modifiers(trimmed);

                // Rust `impl Trait for Type`
                if self.lang == OutlineLanguage::Rust && line.starts_with("impl") {
                    let rest = line.trim_start_matches("impl").trim_start();
                    let rest = if rest.starts_with('<') {
                        rest.find('>').map(|i| rest[i + 1..].trim_start()).unwrap_or(rest)
                    } else {
                        rest
                    };
                    if let Some((trait_part, type_part)) = rest.split_once(" for ") {
                        let trait_name = ident(trait_part.rsplit("::").next().unwrap_or(trait_part));
                        let type_name = ident(type_part.trim());
                        if !trait_name.is_empty() && !type_name.is_empty() {
                            pending_edges.push((
                                type_name.to_string(),
                                trait_name.to_string(),
                                RelationshipType::Implements,
                            ));
                        }
                    }
                }

                for (keyword, ty) in self.lang.declarations() {
                    let Some(rest) = line.strip_prefix(keyword) else {
                        continue;
                    };
                    let (name, ty) = match (self.lang, *ty) {
                        (OutlineLanguage::Go, ComponentType::Function) => match Self::go_receiver(rest) {
                            Some((receiver, method)) => (format!("{}.{}", receiver, ident(method)), ComponentType::Method),
                            None => (ident(rest).to_string(), ComponentType::Function),
                        },
                        (OutlineLanguage::Go, _) => {
                            let name = ident(rest);
                            let ty = if rest.contains(" interface") {
                                ComponentType::Interface
                            } else if rest.contains(" struct") {
                                ComponentType::Struct
                            } else {
                                ComponentType::Other
                            };
                            (name.to_string(), ty)
                        }
                        (_, ty) => (ident(rest).to_string(), ty),
                    };
                    if name.is_empty() || name.ends_with('.') {
                        break;
                    }

                    match self.lang {
                        OutlineLanguage::Python => {
                            if let Some(open) = rest.find('(') {
                                if ty == ComponentType::Class {
                                    let bases = rest[open + 1..].split(')').next().unwrap_or("");
                                    for base in bases.split(',').map(|b| ident(b.trim())) {
                                        if !base.is_empty() && base != "object" {
                                            pending_edges.push((name.clone(), base.to_string(), RelationshipType::Extends));
                                        }
                                    }
                                }
                            }
                        }
                        OutlineLanguage::TypeScript | OutlineLanguage::JavaScript | OutlineLanguage::Java => {
                            for base in names_after(rest, " extends ") {
                                pending_edges.push((name.clone(), base.to_string(), RelationshipType::Extends));
                            }
                            for iface in names_after(rest, " implements ") {
                                pending_edges.push((name.clone(), iface.to_string(), RelationshipType::Implements));
                            }
                        }
                        _ => {}
                    }

                    out.components.push(Component {
                        id: format!("{}#{}", path, name),
                        name: name.clone(),
                        component_type: ty,
                        language: self.lang.name().to_string(),
                        file_path: path.to_string(),
                        span: SourceSpan::lines(line_no, line_no),
                        code_snippet: Some(trimmed.to_string()),
                        metadata: serde_json::json!({}),
                    });
                    declared.push((name, out.components.len() - 1));
                    break;
                }
            }

            if self.lang != OutlineLanguage::Python {
                depth += raw.matches('{').count() as i64;
                depth -= raw.matches('}').count() as i64;
                if depth < 0 {
                    out.errors.push(format!("unbalanced '}}' at line {}", line_no));
                    depth = 0;
                }
            }
        }

        if depth > 0 {
            out.errors.push(format!("{} unclosed '{{' at end of file", depth));
        }

        // Extend each declaration's span to the line before the next one.
        for i in 0..declared.len() {
            let idx = declared[i].1;
            let end = declared
                .get(i + 1)
                .map(|(_, next)| out.components[*next].span.start_line.saturating_sub(1))
                .unwrap_or(total_lines);
            let start = out.components[idx].span.start_line;
            out.components[idx].span.end_line = end.max(start);
        }

        let id_of = |name: &str| -> Option<String> {
            declared
                .iter()
                .find(|(n, _)| n == name)
                .map(|_| format!("{}#{}", path, name))
        };

        for (name, _) in &declared {
            out.relationships.push(
                Relationship::new(path, format!("{}#{}", path, name), RelationshipType::Contains, 1.0)
                    .with_detector("outline"),
            );
        }
        for (from, to, ty) in pending_edges {
            match (id_of(&from), id_of(&to)) {
                (Some(src), Some(tgt)) => out
                    .relationships
                    .push(Relationship::new(src, tgt, ty, 0.9).with_detector("outline")),
                _ => out.warnings.push(format!(
                    "{} {} {} not resolved within file",
                    from,
                    ty.as_str(),
                    to
                )),
            }
        }

        Ok(out)
    }
}
