//! Core data models used throughout Code Harness.
//!
//! These types represent the code graph (components and relationships),
//! the metadata entities layered on top of it (tasks, notes, rules), and
//! the vectors derived from both.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of entity the search engine and embedding pipeline know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Component,
    Task,
    Note,
    Rule,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Component,
        EntityKind::Task,
        EntityKind::Note,
        EntityKind::Rule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Component => "component",
            EntityKind::Task => "task",
            EntityKind::Note => "note",
            EntityKind::Rule => "rule",
        }
    }

    /// Which embedded store owns entities of this kind.
    pub fn store(&self) -> StoreKind {
        match self {
            EntityKind::Component => StoreKind::Code,
            _ => StoreKind::Meta,
        }
    }

    /// Table holding entities of this kind in their store.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Component => "components",
            EntityKind::Task => "tasks",
            EntityKind::Note => "notes",
            EntityKind::Rule => "rules",
        }
    }

    /// Id prefix assigned to generated ids of this kind (`task_`, `note_`, ...).
    ///
    /// Components carry caller-assigned ids and have no fixed prefix.
    pub fn id_prefix(&self) -> Option<&'static str> {
        match self {
            EntityKind::Component => None,
            EntityKind::Task => Some("task_"),
            EntityKind::Note => Some("note_"),
            EntityKind::Rule => Some("rule_"),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "component" | "components" => Ok(EntityKind::Component),
            "task" | "tasks" => Ok(EntityKind::Task),
            "note" | "notes" => Ok(EntityKind::Note),
            "rule" | "rules" => Ok(EntityKind::Rule),
            other => Err(other.to_string()),
        }
    }
}

/// The two embedded stores a project owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Components, relationships, file fingerprints, component embeddings.
    Code,
    /// Tasks, notes, rules, links, tags, and their embeddings.
    Meta,
}

impl StoreKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            StoreKind::Code => "code.sqlite",
            StoreKind::Meta => "meta.sqlite",
        }
    }
}

// ============ Code graph ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    File,
    Module,
    Class,
    Interface,
    Struct,
    Enum,
    Trait,
    Function,
    Method,
    Constructor,
    Property,
    Variable,
    Constant,
    Other,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::File => "file",
            ComponentType::Module => "module",
            ComponentType::Class => "class",
            ComponentType::Interface => "interface",
            ComponentType::Struct => "struct",
            ComponentType::Enum => "enum",
            ComponentType::Trait => "trait",
            ComponentType::Function => "function",
            ComponentType::Method => "method",
            ComponentType::Constructor => "constructor",
            ComponentType::Property => "property",
            ComponentType::Variable => "variable",
            ComponentType::Constant => "constant",
            ComponentType::Other => "other",
        }
    }

    /// Lenient parse used when reading rows back; unknown names map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "file" => ComponentType::File,
            "module" => ComponentType::Module,
            "class" => ComponentType::Class,
            "interface" => ComponentType::Interface,
            "struct" => ComponentType::Struct,
            "enum" => ComponentType::Enum,
            "trait" => ComponentType::Trait,
            "function" => ComponentType::Function,
            "method" => ComponentType::Method,
            "constructor" => ComponentType::Constructor,
            "property" => ComponentType::Property,
            "variable" => ComponentType::Variable,
            "constant" => ComponentType::Constant,
            _ => ComponentType::Other,
        }
    }

    pub fn is_type_like(&self) -> bool {
        matches!(
            self,
            ComponentType::Class
                | ComponentType::Interface
                | ComponentType::Struct
                | ComponentType::Enum
                | ComponentType::Trait
        )
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            ComponentType::Function | ComponentType::Method | ComponentType::Constructor
        )
    }
}

/// Line/column range of a component within its file (1-based lines).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceSpan {
    pub fn lines(start_line: u32, end_line: u32) -> Self {
        Self {
            start_line,
            start_column: 0,
            end_line,
            end_column: 0,
        }
    }
}

/// A named code entity stored as a node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Stable, caller-assigned identifier.
    pub id: String,
    pub name: String,
    pub component_type: ComponentType,
    pub language: String,
    pub file_path: String,
    pub span: SourceSpan,
    pub code_snippet: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Extends,
    ExtendedBy,
    Implements,
    ImplementedBy,
    Uses,
    UsedBy,
    Creates,
    CreatedBy,
    Calls,
    CalledBy,
    Imports,
    ImportedBy,
    Contains,
    ContainedBy,
    References,
    ReferencedBy,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Extends => "extends",
            RelationshipType::ExtendedBy => "extended_by",
            RelationshipType::Implements => "implements",
            RelationshipType::ImplementedBy => "implemented_by",
            RelationshipType::Uses => "uses",
            RelationshipType::UsedBy => "used_by",
            RelationshipType::Creates => "creates",
            RelationshipType::CreatedBy => "created_by",
            RelationshipType::Calls => "calls",
            RelationshipType::CalledBy => "called_by",
            RelationshipType::Imports => "imports",
            RelationshipType::ImportedBy => "imported_by",
            RelationshipType::Contains => "contains",
            RelationshipType::ContainedBy => "contained_by",
            RelationshipType::References => "references",
            RelationshipType::ReferencedBy => "referenced_by",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let ty = match s {
            "extends" => RelationshipType::Extends,
            "extended_by" => RelationshipType::ExtendedBy,
            "implements" => RelationshipType::Implements,
            "implemented_by" => RelationshipType::ImplementedBy,
            "uses" => RelationshipType::Uses,
            "used_by" => RelationshipType::UsedBy,
            "creates" => RelationshipType::Creates,
            "created_by" => RelationshipType::CreatedBy,
            "calls" => RelationshipType::Calls,
            "called_by" => RelationshipType::CalledBy,
            "imports" => RelationshipType::Imports,
            "imported_by" => RelationshipType::ImportedBy,
            "contains" => RelationshipType::Contains,
            "contained_by" => RelationshipType::ContainedBy,
            "references" => RelationshipType::References,
            "referenced_by" => RelationshipType::ReferencedBy,
            _ => return None,
        };
        Some(ty)
    }

    /// The reverse edge type (`extends` ↔ `extended_by`).
    pub fn inverse(&self) -> Self {
        match self {
            RelationshipType::Extends => RelationshipType::ExtendedBy,
            RelationshipType::ExtendedBy => RelationshipType::Extends,
            RelationshipType::Implements => RelationshipType::ImplementedBy,
            RelationshipType::ImplementedBy => RelationshipType::Implements,
            RelationshipType::Uses => RelationshipType::UsedBy,
            RelationshipType::UsedBy => RelationshipType::Uses,
            RelationshipType::Creates => RelationshipType::CreatedBy,
            RelationshipType::CreatedBy => RelationshipType::Creates,
            RelationshipType::Calls => RelationshipType::CalledBy,
            RelationshipType::CalledBy => RelationshipType::Calls,
            RelationshipType::Imports => RelationshipType::ImportedBy,
            RelationshipType::ImportedBy => RelationshipType::Imports,
            RelationshipType::Contains => RelationshipType::ContainedBy,
            RelationshipType::ContainedBy => RelationshipType::Contains,
            RelationshipType::References => RelationshipType::ReferencedBy,
            RelationshipType::ReferencedBy => RelationshipType::References,
        }
    }

    /// True for the direction a parser emits; false for synthesized reverse edges.
    pub fn is_forward(&self) -> bool {
        matches!(
            self,
            RelationshipType::Extends
                | RelationshipType::Implements
                | RelationshipType::Uses
                | RelationshipType::Creates
                | RelationshipType::Calls
                | RelationshipType::Imports
                | RelationshipType::Contains
                | RelationshipType::References
        )
    }
}

/// A directed, typed edge between two component ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    /// Highest confidence reported by any detector, in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Names of the detectors that reported this edge.
    #[serde(default)]
    pub detectors: Vec<String>,
    /// How many candidate edges were merged into this one.
    #[serde(default = "default_detection_count")]
    pub detection_count: u32,
    /// Set on reverse edges synthesized during normalization.
    #[serde(default)]
    pub inferred: bool,
}

fn default_detection_count() -> u32 {
    1
}

impl Relationship {
    /// Build a parser-style candidate edge with a single detector.
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: RelationshipType,
        confidence: f64,
    ) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        Self {
            id: relationship_id(&source_id, &target_id, relationship_type),
            source_id,
            target_id,
            relationship_type,
            confidence,
            metadata: serde_json::Value::Null,
            detectors: Vec::new(),
            detection_count: 1,
            inferred: false,
        }
    }

    pub fn with_detector(mut self, detector: impl Into<String>) -> Self {
        self.detectors.push(detector.into());
        self
    }
}

/// Deterministic edge id: one edge per (source, type, target).
pub fn relationship_id(source_id: &str, target_id: &str, ty: RelationshipType) -> String {
    format!("{}|{}|{}", source_id, ty.as_str(), target_id)
}

// ============ Metadata entities ============

/// A typed reference from a task/note/rule to another entity (not a foreign key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityLink {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityLink {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: Option<String>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<EntityLink>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<EntityLink>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Guidance text shown when the rule applies.
    pub guidance: String,
    pub code_template: Option<String>,
    /// Glob patterns over file paths that make this rule applicable.
    pub trigger_patterns: Vec<String>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<EntityLink>,
    pub applied_count: i64,
    pub accepted_count: i64,
    pub last_applied_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields accepted when creating a task. Ids and timestamps are assigned by the repository.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<EntityLink>,
}

#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub title: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<EntityLink>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRule {
    pub name: String,
    pub description: String,
    pub guidance: String,
    pub code_template: Option<String>,
    pub trigger_patterns: Vec<String>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub links: Vec<EntityLink>,
}

// ============ Embeddings ============

/// A stored vector for one entity. Overwritten in place when regenerated.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    /// Bumped every time the vector is overwritten.
    pub version: i64,
    pub model: String,
    pub dims: usize,
    /// SHA-256 of the text the vector was computed from.
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub created_at: i64,
}

/// Per-file fingerprint kept by the code store for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub size: i64,
    pub modified_at: i64,
    pub indexed_at: i64,
    pub component_count: i64,
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_is_involution() {
        for ty in [
            RelationshipType::Extends,
            RelationshipType::Uses,
            RelationshipType::Creates,
            RelationshipType::Implements,
            RelationshipType::Calls,
            RelationshipType::Imports,
            RelationshipType::Contains,
            RelationshipType::References,
        ] {
            assert!(ty.is_forward());
            assert!(!ty.inverse().is_forward());
            assert_eq!(ty.inverse().inverse(), ty);
            assert_eq!(RelationshipType::parse(ty.inverse().as_str()), Some(ty.inverse()));
        }
    }

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("Notes".parse::<EntityKind>(), Ok(EntityKind::Note));
        assert_eq!("component".parse::<EntityKind>(), Ok(EntityKind::Component));
        assert!("widget".parse::<EntityKind>().is_err());
        assert_eq!(EntityKind::Task.store(), StoreKind::Meta);
        assert_eq!(EntityKind::Component.store(), StoreKind::Code);
    }

    #[test]
    fn test_component_type_parse_is_lenient() {
        assert_eq!(ComponentType::parse("class"), ComponentType::Class);
        assert_eq!(ComponentType::parse("lambda"), ComponentType::Other);
        assert!(ComponentType::Interface.is_type_like());
        assert!(ComponentType::Method.is_callable());
    }

    #[test]
    fn test_relationship_id_is_deterministic() {
        let a = Relationship::new("A", "B", RelationshipType::Extends, 0.9);
        let b = Relationship::new("A", "B", RelationshipType::Extends, 0.4);
        assert_eq!(a.id, b.id);
        assert_ne!(
            a.id,
            Relationship::new("B", "A", RelationshipType::Extends, 0.9).id
        );
    }
}
