//! Pure normalization between parse and persist.
//!
//! 1. Components are deduplicated by id (first occurrence wins).
//! 2. Candidate edges are reduced by `(source, target, type)`: the merged
//!    edge keeps the highest confidence and that candidate's metadata, the
//!    union of detector names, and the number of candidates merged.
//! 3. Every forward edge without an explicit reverse gets a synthesized
//!    inverse edge marked `inferred`.
//!
//! Output is sorted by id so the same input always yields the same rows.

use std::collections::{BTreeMap, HashSet};

use crate::models::{relationship_id, Component, Relationship, RelationshipType};
use crate::parser::ParseOutput;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub components: Vec<Component>,
    pub relationships: Vec<Relationship>,
}

pub fn normalize(output: ParseOutput) -> Normalized {
    let components = dedup_components(output.components);
    let reduced = reduce_relationships(output.relationships);
    let relationships = synthesize_inverses(reduced);
    Normalized {
        components,
        relationships,
    }
}

pub fn dedup_components(components: Vec<Component>) -> Vec<Component> {
    let mut seen = HashSet::new();
    components
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect()
}

/// Merge candidate edges that share `(source, target, type)`.
pub fn reduce_relationships(candidates: Vec<Relationship>) -> Vec<Relationship> {
    let mut merged: BTreeMap<(String, String, RelationshipType), Relationship> = BTreeMap::new();

    for candidate in candidates {
        let key = (
            candidate.source_id.clone(),
            candidate.target_id.clone(),
            candidate.relationship_type,
        );
        match merged.get_mut(&key) {
            None => {
                let mut edge = candidate;
                edge.id = relationship_id(&edge.source_id, &edge.target_id, edge.relationship_type);
                edge.confidence = edge.confidence.clamp(0.0, 1.0);
                edge.detection_count = edge.detection_count.max(1);
                edge.detectors.sort();
                edge.detectors.dedup();
                merged.insert(key, edge);
            }
            Some(edge) => {
                let confidence = candidate.confidence.clamp(0.0, 1.0);
                if confidence > edge.confidence {
                    edge.confidence = confidence;
                    edge.metadata = candidate.metadata;
                }
                edge.detection_count += candidate.detection_count.max(1);
                edge.inferred &= candidate.inferred;
                for d in candidate.detectors {
                    if !edge.detectors.contains(&d) {
                        edge.detectors.push(d);
                    }
                }
                edge.detectors.sort();
            }
        }
    }

    let mut out: Vec<Relationship> = merged.into_values().collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// Add the reverse of every forward edge that has no explicit reverse.
/// Self-loops get no inverse.
pub fn synthesize_inverses(edges: Vec<Relationship>) -> Vec<Relationship> {
    let existing: HashSet<String> = edges.iter().map(|e| e.id.clone()).collect();
    let mut out = edges.clone();

    for edge in &edges {
        if !edge.relationship_type.is_forward() || edge.source_id == edge.target_id {
            continue;
        }
        let ty = edge.relationship_type.inverse();
        let id = relationship_id(&edge.target_id, &edge.source_id, ty);
        if existing.contains(&id) {
            continue;
        }
        out.push(Relationship {
            id,
            source_id: edge.target_id.clone(),
            target_id: edge.source_id.clone(),
            relationship_type: ty,
            confidence: edge.confidence,
            metadata: edge.metadata.clone(),
            detectors: edge.detectors.clone(),
            detection_count: edge.detection_count,
            inferred: true,
        });
    }

    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentType, SourceSpan};

    fn component(id: &str, name: &str) -> Component {
        Component {
            id: id.into(),
            name: name.into(),
            component_type: ComponentType::Class,
            language: "java".into(),
            file_path: "A.java".into(),
            span: SourceSpan::default(),
            code_snippet: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_reducer_keeps_max_confidence_and_counts() {
        let edges = vec![
            Relationship::new("A", "B", RelationshipType::Extends, 0.4).with_detector("syntax"),
            Relationship::new("A", "B", RelationshipType::Extends, 0.9).with_detector("types"),
            Relationship::new("A", "B", RelationshipType::Extends, 0.7).with_detector("syntax"),
            Relationship::new("A", "C", RelationshipType::Uses, 0.5),
        ];
        let reduced = reduce_relationships(edges);
        assert_eq!(reduced.len(), 2);
        let ab = reduced
            .iter()
            .find(|r| r.target_id == "B")
            .unwrap();
        assert!((ab.confidence - 0.9).abs() < 1e-9);
        assert_eq!(ab.detection_count, 3);
        assert_eq!(ab.detectors, vec!["syntax".to_string(), "types".to_string()]);
    }

    #[test]
    fn test_inverse_synthesis() {
        let edges = vec![
            Relationship::new("A", "B", RelationshipType::Extends, 0.9),
            // Explicit reverse already present: no duplicate.
            Relationship::new("C", "D", RelationshipType::Uses, 0.8),
            Relationship::new("D", "C", RelationshipType::UsedBy, 0.6),
            Relationship::new("E", "E", RelationshipType::Calls, 1.0),
        ];
        let out = synthesize_inverses(reduce_relationships(edges));

        let ba = out
            .iter()
            .find(|r| r.source_id == "B" && r.target_id == "A")
            .unwrap();
        assert_eq!(ba.relationship_type, RelationshipType::ExtendedBy);
        assert!(ba.inferred);
        assert_eq!(
            out.iter()
                .filter(|r| r.relationship_type == RelationshipType::UsedBy)
                .count(),
            1
        );
        assert_eq!(out.iter().filter(|r| r.source_id == "E").count(), 1);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let output = ParseOutput {
            components: vec![component("A", "A"), component("B", "B"), component("A", "A2")],
            relationships: vec![
                Relationship::new("B", "A", RelationshipType::Extends, 0.8),
                Relationship::new("A", "B", RelationshipType::Uses, 0.5),
            ],
            ..Default::default()
        };
        let first = normalize(output.clone());
        let second = normalize(output);
        assert_eq!(first, second);
        assert_eq!(first.components.len(), 2);
        assert_eq!(first.components[0].name, "A");
        assert_eq!(first.relationships.len(), 4);
    }

    #[test]
    fn test_first_duplicate_wins_and_external_targets_are_kept() {
        let output = ParseOutput {
            components: vec![component("A", "first"), component("A", "second")],
            relationships: vec![Relationship::new("A", "lib.rs#External", RelationshipType::Imports, 0.7)],
            ..Default::default()
        };
        let out = normalize(output);
        assert_eq!(out.components.len(), 1);
        assert_eq!(out.components[0].name, "first");
        // Targets outside the file are resolved at query time, not dropped here.
        assert!(out
            .relationships
            .iter()
            .any(|r| r.source_id == "A" && r.target_id == "lib.rs#External"));
    }
}
