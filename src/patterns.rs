//! Design-pattern heuristics and graph-shape metrics.
//!
//! [`analyze`] is a pure function of a graph snapshot. Each heuristic adds
//! weighted evidence for one type-like component; matches scoring above
//! [`MATCH_THRESHOLD`] are reported along with the evidence behind them.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::models::{Component, ComponentType, Relationship, RelationshipType};

pub const MATCH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Factory,
    Singleton,
    Observer,
    Builder,
    Strategy,
    Decorator,
}

impl PatternKind {
    pub const ALL: [PatternKind; 6] = [
        PatternKind::Factory,
        PatternKind::Singleton,
        PatternKind::Observer,
        PatternKind::Builder,
        PatternKind::Strategy,
        PatternKind::Decorator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Factory => "factory",
            PatternKind::Singleton => "singleton",
            PatternKind::Observer => "observer",
            PatternKind::Builder => "builder",
            PatternKind::Strategy => "strategy",
            PatternKind::Decorator => "decorator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    pub pattern: PatternKind,
    pub component_id: String,
    pub name: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphMetrics {
    pub components: usize,
    pub relationships: usize,
    /// Back edges found by depth-first traversal of forward edges.
    pub cycles: usize,
    /// Longest breadth-first layer reached from an indegree-zero root.
    pub max_depth: usize,
    /// Mean out-degree over components with at least one outgoing edge.
    pub avg_branching: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatternReport {
    pub matches: Vec<PatternMatch>,
    pub metrics: GraphMetrics,
}

pub fn analyze(components: &[Component], relationships: &[Relationship]) -> PatternReport {
    let graph = Graph::new(components, relationships);
    let mut matches = Vec::new();

    for c in graph.components.values() {
        if !is_type_like(c.component_type) {
            continue;
        }
        let members = graph.members(c);
        for kind in PatternKind::ALL {
            let mut ev = Evidence::default();
            match kind {
                PatternKind::Factory => factory(&graph, c, &members, &mut ev),
                PatternKind::Singleton => singleton(&graph, c, &members, &mut ev),
                PatternKind::Observer => observer(&graph, c, &members, &mut ev),
                PatternKind::Builder => builder(c, &members, &mut ev),
                PatternKind::Strategy => strategy(&graph, c, &mut ev),
                PatternKind::Decorator => decorator(&graph, c, &mut ev),
            }
            let confidence = ev.score.min(1.0);
            if confidence > MATCH_THRESHOLD {
                matches.push(PatternMatch {
                    pattern: kind,
                    component_id: c.id.clone(),
                    name: c.name.clone(),
                    confidence,
                    evidence: ev.items,
                });
            }
        }
    }

    matches.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pattern.cmp(&b.pattern))
            .then(a.component_id.cmp(&b.component_id))
    });

    PatternReport {
        matches,
        metrics: graph.metrics(),
    }
}

fn is_type_like(ty: ComponentType) -> bool {
    matches!(
        ty,
        ComponentType::Class
            | ComponentType::Interface
            | ComponentType::Struct
            | ComponentType::Trait
            | ComponentType::Enum
            | ComponentType::Other
    )
}

#[derive(Default)]
struct Evidence {
    score: f64,
    items: Vec<String>,
}

impl Evidence {
    fn add(&mut self, weight: f64, item: impl Into<String>) {
        self.score += weight;
        self.items.push(item.into());
    }
}

fn name_has(c: &Component, needles: &[&str]) -> Option<String> {
    let lower = c.name.to_lowercase();
    needles
        .iter()
        .find(|n| lower.contains(*n))
        .map(|n| n.to_string())
}

fn members_with_prefix<'a>(members: &'a [String], prefixes: &[&str]) -> Vec<&'a str> {
    members
        .iter()
        .filter(|m| {
            let lower = m.to_lowercase();
            prefixes.iter().any(|p| lower.starts_with(p))
        })
        .map(String::as_str)
        .collect()
}

fn factory(graph: &Graph, c: &Component, members: &[String], ev: &mut Evidence) {
    if name_has(c, &["factory"]).is_some() {
        ev.add(0.4, "name contains 'Factory'");
    }
    let creators = members_with_prefix(members, &["create", "make", "build", "new_", "new"]);
    if !creators.is_empty() {
        ev.add(0.3, format!("creation methods: {}", creators.join(", ")));
    }
    let created = graph.out_count(&c.id, RelationshipType::Creates);
    if created > 0 {
        ev.add((0.15 * created as f64).min(0.3), format!("creates {} types", created));
    }
}

fn singleton(graph: &Graph, c: &Component, members: &[String], ev: &mut Evidence) {
    if name_has(c, &["singleton"]).is_some() {
        ev.add(0.3, "name contains 'Singleton'");
    }
    let accessors: Vec<&str> = members
        .iter()
        .filter(|m| {
            matches!(
                m.to_lowercase().as_str(),
                "getinstance" | "get_instance" | "instance" | "shared" | "default_instance"
            )
        })
        .map(String::as_str)
        .collect();
    if !accessors.is_empty() {
        ev.add(0.5, format!("instance accessor: {}", accessors.join(", ")));
    }
    let users = graph.in_count(&c.id, RelationshipType::Uses);
    if users >= 2 {
        ev.add(0.2, format!("used by {} components", users));
    }
}

fn observer(graph: &Graph, c: &Component, members: &[String], ev: &mut Evidence) {
    if let Some(n) = name_has(c, &["observer", "listener", "subscriber", "publisher", "emitter"]) {
        ev.add(0.3, format!("name contains '{}'", n));
    }
    let hooks: HashSet<String> = members
        .iter()
        .map(|m| m.to_lowercase())
        .filter(|m| {
            ["subscribe", "unsubscribe", "addlistener", "removelistener", "add_listener", "remove_listener", "notify", "emit", "attach", "detach"]
                .iter()
                .any(|h| m.starts_with(h))
        })
        .collect();
    match hooks.len() {
        0 => {}
        1 => ev.add(0.2, "one notification method"),
        n => ev.add(0.4, format!("{} subscription/notification methods", n)),
    }
    let implementers = graph.implementers(&c.id);
    if implementers >= 2 && name_has(c, &["observer", "listener"]).is_some() {
        ev.add(0.3, format!("{} implementations", implementers));
    }
}

fn builder(c: &Component, members: &[String], ev: &mut Evidence) {
    if c.name.to_lowercase().ends_with("builder") {
        ev.add(0.5, "name ends with 'Builder'");
    }
    let setters = members_with_prefix(members, &["with_", "with", "set_", "set"]);
    if setters.len() >= 2 {
        ev.add(0.2, format!("{} fluent setters", setters.len()));
    }
    if members.iter().any(|m| m.eq_ignore_ascii_case("build")) {
        ev.add(0.3, "has build()");
    }
}

fn strategy(graph: &Graph, c: &Component, ev: &mut Evidence) {
    let implementers = graph.implementers(&c.id);
    if matches!(c.component_type, ComponentType::Interface | ComponentType::Trait) && implementers >= 2 {
        ev.add(0.5, format!("abstraction with {} implementations", implementers));
    }
    if let Some(n) = name_has(c, &["strategy", "policy"]) {
        ev.add(0.3, format!("name contains '{}'", n));
    }
    let users = graph.in_count(&c.id, RelationshipType::Uses);
    if users > 0 {
        ev.add(0.2, format!("used by {} context components", users));
    }
}

fn decorator(graph: &Graph, c: &Component, ev: &mut Evidence) {
    if let Some(n) = name_has(c, &["decorator", "wrapper"]) {
        ev.add(0.4, format!("name contains '{}'", n));
    }
    let parents: HashSet<&str> = graph
        .out_targets(&c.id, RelationshipType::Implements)
        .chain(graph.out_targets(&c.id, RelationshipType::Extends))
        .collect();
    let wrapped: Vec<&str> = graph
        .out_targets(&c.id, RelationshipType::Uses)
        .chain(graph.out_targets(&c.id, RelationshipType::References))
        .filter(|t| parents.contains(t))
        .collect();
    if let Some(target) = wrapped.first() {
        ev.add(0.4, format!("implements and wraps {}", target));
    }
    if !parents.is_empty() && name_has(c, &["decorator", "wrapper", "proxy"]).is_some() && wrapped.is_empty() {
        ev.add(0.2, "inherits from the type it is named to wrap");
    }
}

// ============ Graph ============

struct Graph<'a> {
    components: BTreeMap<&'a str, &'a Component>,
    /// Forward edges only; synthesized inverses would turn every edge into a cycle.
    forward: BTreeMap<&'a str, Vec<(&'a str, RelationshipType)>>,
    incoming: HashMap<&'a str, Vec<(&'a str, RelationshipType)>>,
    /// `(file, owner)` to member names, for components named `Owner.member`.
    dotted: HashMap<(&'a str, &'a str), Vec<&'a str>>,
    edge_count: usize,
}

impl<'a> Graph<'a> {
    fn new(components: &'a [Component], relationships: &'a [Relationship]) -> Self {
        let mut forward: BTreeMap<&str, Vec<(&str, RelationshipType)>> = BTreeMap::new();
        let mut incoming: HashMap<&str, Vec<(&str, RelationshipType)>> = HashMap::new();
        for r in relationships {
            let (src, tgt, ty) = if r.relationship_type.is_forward() {
                (r.source_id.as_str(), r.target_id.as_str(), r.relationship_type)
            } else {
                (r.target_id.as_str(), r.source_id.as_str(), r.relationship_type.inverse())
            };
            let out = forward.entry(src).or_default();
            if !out.contains(&(tgt, ty)) {
                out.push((tgt, ty));
                incoming.entry(tgt).or_default().push((src, ty));
            }
        }
        for out in forward.values_mut() {
            out.sort();
        }
        let mut dotted: HashMap<(&str, &str), Vec<&str>> = HashMap::new();
        for c in components {
            for (dot, _) in c.name.match_indices('.') {
                dotted
                    .entry((c.file_path.as_str(), &c.name[..dot]))
                    .or_default()
                    .push(&c.name[dot + 1..]);
            }
        }
        Self {
            components: components.iter().map(|c| (c.id.as_str(), c)).collect(),
            edge_count: forward.values().map(Vec::len).sum(),
            forward,
            incoming,
            dotted,
        }
    }

    fn out_targets(&self, id: &str, ty: RelationshipType) -> impl Iterator<Item = &'a str> + '_ {
        self.forward
            .get(id)
            .into_iter()
            .flatten()
            .filter(move |(_, t)| *t == ty)
            .map(|(target, _)| *target)
    }

    fn out_count(&self, id: &str, ty: RelationshipType) -> usize {
        self.out_targets(id, ty).count()
    }

    fn in_count(&self, id: &str, ty: RelationshipType) -> usize {
        self.incoming
            .get(id)
            .map_or(0, |v| v.iter().filter(|(_, t)| *t == ty).count())
    }

    fn implementers(&self, id: &str) -> usize {
        self.in_count(id, RelationshipType::Implements) + self.in_count(id, RelationshipType::Extends)
    }

    /// Member names: `metadata.methods`, contained components, and
    /// same-file components named `Type.member`.
    fn members(&self, c: &Component) -> Vec<String> {
        let mut names: Vec<String> = c
            .metadata
            .get("methods")
            .and_then(|m| m.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        for target in self.out_targets(&c.id, RelationshipType::Contains) {
            if let Some(child) = self.components.get(target) {
                names.push(child.name.clone());
            }
        }
        if let Some(dotted) = self.dotted.get(&(c.file_path.as_str(), c.name.as_str())) {
            names.extend(dotted.iter().map(|m| m.to_string()));
        }
        names.sort();
        names.dedup();
        names
    }

    fn nodes(&self) -> Vec<&'a str> {
        let mut nodes: HashSet<&str> = self.components.keys().copied().collect();
        for (src, out) in &self.forward {
            nodes.insert(src);
            nodes.extend(out.iter().map(|(t, _)| *t));
        }
        let mut nodes: Vec<&str> = nodes.into_iter().collect();
        nodes.sort();
        nodes
    }

    fn metrics(&self) -> GraphMetrics {
        let nodes = self.nodes();
        let with_out: Vec<usize> = self.forward.values().map(Vec::len).filter(|n| *n > 0).collect();
        GraphMetrics {
            components: self.components.len(),
            relationships: self.edge_count,
            cycles: self.count_cycles(&nodes),
            max_depth: self.max_depth(&nodes),
            avg_branching: if with_out.is_empty() {
                0.0
            } else {
                with_out.iter().sum::<usize>() as f64 / with_out.len() as f64
            },
        }
    }

    fn successors(&self, id: &str) -> Vec<&'a str> {
        let mut out: Vec<&str> = self
            .forward
            .get(id)
            .map(|v| v.iter().map(|(t, _)| *t).collect())
            .unwrap_or_default();
        out.dedup();
        out
    }

    /// Iterative DFS; each edge into a node on the active path is one cycle.
    fn count_cycles(&self, nodes: &[&'a str]) -> usize {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut cycles = 0;

        for &start in nodes {
            if visited.contains(start) {
                continue;
            }
            // (node, successors, next successor index)
            let mut stack: Vec<(&str, Vec<&str>, usize)> = vec![(start, self.successors(start), 0)];
            visited.insert(start);
            on_stack.insert(start);

            while let Some((node, succ, idx)) = stack.last_mut() {
                if *idx < succ.len() {
                    let next = succ[*idx];
                    *idx += 1;
                    if on_stack.contains(next) {
                        cycles += 1;
                    } else if visited.insert(next) {
                        on_stack.insert(next);
                        let next_succ = self.successors(next);
                        stack.push((next, next_succ, 0));
                    }
                } else {
                    on_stack.remove(*node);
                    stack.pop();
                }
            }
        }
        cycles
    }

    /// BFS layering from indegree-zero roots. Roots are depth 0.
    fn max_depth(&self, nodes: &[&'a str]) -> usize {
        let roots: Vec<&str> = nodes
            .iter()
            .copied()
            .filter(|n| self.incoming.get(n).map_or(true, Vec::is_empty))
            .collect();

        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for root in roots {
            depth.insert(root, 0);
            queue.push_back(root);
        }
        let mut max = 0;
        while let Some(node) = queue.pop_front() {
            let d = depth.get(node).copied().unwrap_or(0);
            max = max.max(d);
            for next in self.successors(node) {
                if !depth.contains_key(next) {
                    depth.insert(next, d + 1);
                    queue.push_back(next);
                }
            }
        }
        max
    }
}
