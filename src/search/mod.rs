//! Search & ranking across components, tasks, notes and rules.
//!
//! A request fans out to one [`SearchSource`] per requested entity kind.
//! Each source contributes lexical candidates; stored vectors of that kind
//! contribute semantic candidates scored by cosine similarity against a
//! query vector computed once per request. The merged set is reranked,
//! capped per kind, sorted and truncated.
//!
//! When no query vector is available (embeddings disabled, backend down,
//! nothing embedded yet) ranking degrades to lexical scores alone.
//!
//! Queries shaped like an entity id skip ranking: an exact id match, or a
//! generated-id prefix such as `task_3f2a`, resolves directly.

pub mod rerank;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, embed_query, EmbeddingBackend};
use crate::error::SearchError;
use crate::models::{Component, EntityKind, Note, Rule, Task};
use crate::repository::{
    ComponentRepository, EmbeddingRepository, NoteRepository, RuleRepository, TaskRepository,
};
use rerank::Reranker;

const SNIPPET_CHARS: usize = 240;

/// A search request. An empty `types` list means every kind.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub types: Vec<EntityKind>,
    pub limit: Option<usize>,
    pub per_type_cap: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_types(mut self, types: Vec<EntityKind>) -> Self {
        self.types = types;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_per_type_cap(mut self, cap: usize) -> Self {
        self.per_type_cap = Some(cap);
        self
    }
}

/// Parse user-supplied type names (`component`, `task`, ...).
pub fn parse_types(names: &[String]) -> Result<Vec<EntityKind>, SearchError> {
    names
        .iter()
        .map(|n| {
            n.parse::<EntityKind>()
                .map_err(|_| SearchError::UnknownEntityType(n.clone()))
        })
        .collect()
}

/// One ranked candidate, before it becomes a [`SearchHit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub kind: EntityKind,
    pub title: String,
    pub snippet: String,
    pub lexical: f64,
    pub semantic: Option<f64>,
    pub score: f64,
}

impl Candidate {
    fn new(id: &str, kind: EntityKind, title: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            title: title.to_string(),
            snippet: body.chars().take(SNIPPET_CHARS).collect(),
            lexical: 0.0,
            semantic: None,
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub kind: EntityKind,
    pub title: String,
    pub snippet: String,
    pub score: f64,
    pub lexical_score: f64,
    pub semantic_score: Option<f64>,
    /// Components one hop away in the relationship graph.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Whether a query vector took part in ranking.
    pub semantic: bool,
    /// Set when the query resolved as an id and ranking was skipped.
    pub direct: bool,
}

/// What the engine needs from a repository to search one entity kind.
///
/// Only `kind`, `lexical` and `fetch` are required; id-prefix lookup and
/// graph neighbors fall back to "nothing" for sources that lack them.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn lexical(&self, query: &str, limit: usize) -> Result<Vec<Candidate>>;

    /// Load candidates by id, skipping ids that do not exist.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Candidate>>;

    async fn by_id_prefix(&self, _prefix: &str, _limit: usize) -> Result<Vec<Candidate>> {
        Ok(Vec::new())
    }

    async fn related(&self, _id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// ============ Sources ============

fn component_candidate(c: &Component) -> Candidate {
    let body = c.code_snippet.as_deref().unwrap_or(&c.file_path);
    Candidate::new(&c.id, EntityKind::Component, &c.name, body)
}

fn task_candidate(t: &Task) -> Candidate {
    Candidate::new(&t.id, EntityKind::Task, &t.title, &t.description)
}

fn note_candidate(n: &Note) -> Candidate {
    Candidate::new(&n.id, EntityKind::Note, &n.title, &n.content)
}

fn rule_candidate(r: &Rule) -> Candidate {
    Candidate::new(&r.id, EntityKind::Rule, &r.name, &r.guidance)
}

fn with_lexical(mut c: Candidate, score: f64) -> Candidate {
    c.lexical = score;
    c
}

pub struct ComponentSource(pub ComponentRepository);

#[async_trait]
impl SearchSource for ComponentSource {
    fn kind(&self) -> EntityKind {
        EntityKind::Component
    }

    async fn lexical(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .search_lexical(query, limit)
            .await?
            .iter()
            .map(|(c, s)| with_lexical(component_candidate(c), *s))
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Candidate>> {
        Ok(self.0.get_many(ids).await?.iter().map(component_candidate).collect())
    }

    async fn by_id_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .by_id_prefix(prefix, limit as i64)
            .await?
            .iter()
            .map(component_candidate)
            .collect())
    }

    async fn related(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.0.neighbors(id).await?.into_iter().map(|c| c.id).collect())
    }
}

pub struct TaskSource(pub TaskRepository);

#[async_trait]
impl SearchSource for TaskSource {
    fn kind(&self) -> EntityKind {
        EntityKind::Task
    }

    async fn lexical(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .search_lexical(query, limit)
            .await?
            .iter()
            .map(|(t, s)| with_lexical(task_candidate(t), *s))
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(t) = self.0.get(id).await? {
                out.push(task_candidate(&t));
            }
        }
        Ok(out)
    }

    async fn by_id_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .by_id_prefix(prefix, limit as i64)
            .await?
            .iter()
            .map(task_candidate)
            .collect())
    }
}

pub struct NoteSource(pub NoteRepository);

#[async_trait]
impl SearchSource for NoteSource {
    fn kind(&self) -> EntityKind {
        EntityKind::Note
    }

    async fn lexical(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .search_lexical(query, limit)
            .await?
            .iter()
            .map(|(n, s)| with_lexical(note_candidate(n), *s))
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(n) = self.0.get(id).await? {
                out.push(note_candidate(&n));
            }
        }
        Ok(out)
    }

    async fn by_id_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .by_id_prefix(prefix, limit as i64)
            .await?
            .iter()
            .map(note_candidate)
            .collect())
    }
}

pub struct RuleSource(pub RuleRepository);

#[async_trait]
impl SearchSource for RuleSource {
    fn kind(&self) -> EntityKind {
        EntityKind::Rule
    }

    async fn lexical(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .search_lexical(query, limit)
            .await?
            .iter()
            .map(|(r, s)| with_lexical(rule_candidate(r), *s))
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Candidate>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(r) = self.0.get(id).await? {
                out.push(rule_candidate(&r));
            }
        }
        Ok(out)
    }

    async fn by_id_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<Candidate>> {
        Ok(self
            .0
            .by_id_prefix(prefix, limit as i64)
            .await?
            .iter()
            .map(rule_candidate)
            .collect())
    }
}

// ============ Engine ============

pub struct SearchEngine {
    sources: BTreeMap<EntityKind, Arc<dyn SearchSource>>,
    embeddings: EmbeddingRepository,
    backend: Arc<dyn EmbeddingBackend>,
    reranker: Box<dyn Reranker>,
    config: RetrievalConfig,
}

impl SearchEngine {
    pub fn new(
        sources: Vec<Arc<dyn SearchSource>>,
        embeddings: EmbeddingRepository,
        backend: Arc<dyn EmbeddingBackend>,
        reranker: Box<dyn Reranker>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.kind(), s)).collect(),
            embeddings,
            backend,
            reranker,
            config,
        }
    }

    pub fn reranker_name(&self) -> &'static str {
        self.reranker.name()
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery.into());
        }
        if request.limit == Some(0) || request.per_type_cap == Some(0) {
            return Err(SearchError::InvalidLimit.into());
        }
        let limit = request.limit.unwrap_or(self.config.default_limit);

        let kinds: Vec<EntityKind> = if request.types.is_empty() {
            self.sources.keys().copied().collect()
        } else {
            let mut kinds = request.types.clone();
            kinds.sort();
            kinds.dedup();
            kinds
        };
        let mut sources = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            let source = self
                .sources
                .get(kind)
                .ok_or_else(|| SearchError::UnknownEntityType(kind.as_str().to_string()))?;
            sources.push(Arc::clone(source));
        }

        if let Some(direct) = self.resolve_direct(query, &sources, limit).await? {
            return Ok(direct);
        }

        let query_vec = self.query_vector(query).await;
        let mut candidates: Vec<Candidate> = Vec::new();
        for source in &sources {
            candidates.extend(self.candidates_for(source.as_ref(), query, query_vec.as_deref()).await?);
        }
        candidates.retain(|c| c.score >= self.config.min_score);

        sort_candidates(&mut candidates);
        rerank_head(self.reranker.as_ref(), query, &mut candidates, self.config.rerank_top_k);

        let ranked = merge_ranked(candidates, request.per_type_cap, limit);
        let mut hits = Vec::with_capacity(ranked.len());
        for c in ranked {
            let related = match self.sources.get(&c.kind) {
                Some(source) => source.related(&c.id).await?,
                None => Vec::new(),
            };
            hits.push(SearchHit {
                id: c.id,
                kind: c.kind,
                title: c.title,
                snippet: c.snippet,
                score: c.score,
                lexical_score: c.lexical,
                semantic_score: c.semantic,
                related,
            });
        }

        debug!(query, hits = hits.len(), semantic = query_vec.is_some(), "search finished");
        Ok(SearchResponse {
            hits,
            semantic: query_vec.is_some(),
            direct: false,
        })
    }

    /// Exact id or generated-id prefix lookups.
    async fn resolve_direct(
        &self,
        query: &str,
        sources: &[Arc<dyn SearchSource>],
        limit: usize,
    ) -> Result<Option<SearchResponse>> {
        if query.contains(char::is_whitespace) {
            return Ok(None);
        }

        let mut found = Vec::new();
        for source in sources {
            found.extend(source.fetch(&[query.to_string()]).await?);
        }
        if found.is_empty() {
            for source in sources {
                let Some(prefix) = source.kind().id_prefix() else {
                    continue;
                };
                if query.len() > prefix.len() && query.starts_with(prefix) {
                    found.extend(source.by_id_prefix(query, limit).await?);
                }
            }
        }
        if found.is_empty() {
            return Ok(None);
        }

        found.sort_by(|a, b| a.id.cmp(&b.id));
        found.truncate(limit);
        let hits = found
            .into_iter()
            .map(|c| SearchHit {
                id: c.id,
                kind: c.kind,
                title: c.title,
                snippet: c.snippet,
                score: 1.0,
                lexical_score: 1.0,
                semantic_score: None,
                related: Vec::new(),
            })
            .collect();
        Ok(Some(SearchResponse {
            hits,
            semantic: false,
            direct: true,
        }))
    }

    async fn query_vector(&self, query: &str) -> Option<Vec<f32>> {
        if self.backend.dims() == 0 {
            return None;
        }
        match embed_query(self.backend.as_ref(), query).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "query embedding failed, ranking lexically");
                None
            }
        }
    }

    async fn candidates_for(
        &self,
        source: &dyn SearchSource,
        query: &str,
        query_vec: Option<&[f32]>,
    ) -> Result<Vec<Candidate>> {
        let k = self.config.candidate_k;
        let mut by_id: HashMap<String, Candidate> = source
            .lexical(query, k)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        if let Some(qv) = query_vec {
            let mut scored: Vec<(String, f64)> = self
                .embeddings
                .vectors(source.kind())
                .await?
                .into_iter()
                .map(|(id, v)| (id, cosine_similarity(qv, &v) as f64))
                .filter(|(_, s)| *s > 0.0)
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
            scored.truncate(k);

            let missing: Vec<String> = scored
                .iter()
                .filter(|(id, _)| !by_id.contains_key(id))
                .map(|(id, _)| id.clone())
                .collect();
            if !missing.is_empty() {
                for c in source.fetch(&missing).await? {
                    by_id.insert(c.id.clone(), c);
                }
            }
            for (id, sim) in scored {
                if let Some(c) = by_id.get_mut(&id) {
                    c.semantic = Some(sim);
                }
            }
        }

        Ok(by_id
            .into_values()
            .map(|mut c| {
                c.score = c.semantic.unwrap_or(c.lexical);
                c
            })
            .collect())
    }
}

/// Descending score, then kind and id so equal scores order deterministically.
fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.kind.cmp(&b.kind))
            .then(a.id.cmp(&b.id))
    });
}

/// Rerank the first `top_k` of `sorted` and reorder within that block.
///
/// The block stays ahead of the tail. Rerankers may move scores onto a
/// different scale, so tail scores are scaled down to at most the block's
/// lowest score, keeping scores non-increasing down the list.
fn rerank_head(reranker: &dyn Reranker, query: &str, sorted: &mut [Candidate], top_k: usize) {
    let top_k = top_k.min(sorted.len());
    let (head, tail) = sorted.split_at_mut(top_k);
    reranker.rerank(query, head);
    sort_candidates(head);

    let (Some(floor), Some(first)) = (head.last().map(|c| c.score), tail.first().map(|c| c.score)) else {
        return;
    };
    if first > floor && first > 0.0 {
        let factor = floor.max(0.0) / first;
        for c in tail.iter_mut() {
            c.score *= factor;
        }
    }
}

/// Dedup by id, apply the per-kind cap, truncate. Input must be sorted.
fn merge_ranked(sorted: Vec<Candidate>, per_type_cap: Option<usize>, limit: usize) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut per_kind: HashMap<EntityKind, usize> = HashMap::new();
    let mut out = Vec::new();
    for c in sorted {
        if out.len() == limit {
            break;
        }
        if !seen.insert((c.kind, c.id.clone())) {
            continue;
        }
        let n = per_kind.entry(c.kind).or_default();
        if per_type_cap.is_some_and(|cap| *n >= cap) {
            continue;
        }
        *n += 1;
        out.push(c);
    }
    out
}
