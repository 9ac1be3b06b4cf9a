//! Second-pass scorers applied to the top candidates of a search.

use anyhow::{bail, Result};

use super::Candidate;
use crate::config::RetrievalConfig;

pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite `score` on each candidate. Order is restored by the caller.
    fn rerank(&self, query: &str, candidates: &mut [Candidate]);
}

/// Leaves first-pass scores untouched.
pub struct NoRerank;

impl Reranker for NoRerank {
    fn name(&self) -> &'static str {
        "none"
    }

    fn rerank(&self, _query: &str, _candidates: &mut [Candidate]) {}
}

/// Convex blend of min-max normalized lexical and semantic scores:
/// `(1 - alpha) * lexical + alpha * semantic`.
///
/// When no candidate carries a semantic score the blend is purely lexical.
pub struct HybridRerank {
    pub alpha: f64,
}

impl Reranker for HybridRerank {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn rerank(&self, _query: &str, candidates: &mut [Candidate]) {
        if candidates.is_empty() {
            return;
        }
        let lexical: Vec<f64> = candidates.iter().map(|c| c.lexical).collect();
        let semantic: Vec<f64> = candidates.iter().map(|c| c.semantic.unwrap_or(0.0)).collect();
        let alpha = if candidates.iter().any(|c| c.semantic.is_some()) {
            self.alpha
        } else {
            0.0
        };

        let lexical = min_max(&lexical);
        let semantic = min_max(&semantic);
        for (i, c) in candidates.iter_mut().enumerate() {
            c.score = (1.0 - alpha) * lexical[i] + alpha * semantic[i];
        }
    }
}

/// Multiplies the first-pass score by `1 + boost * f`, where `f` is the
/// fraction of query terms that appear in the candidate's title.
pub struct KeywordBoost {
    pub boost: f64,
}

impl Reranker for KeywordBoost {
    fn name(&self) -> &'static str {
        "keyword_boost"
    }

    fn rerank(&self, query: &str, candidates: &mut [Candidate]) {
        let terms: Vec<String> = query.split_whitespace().map(|t| t.to_lowercase()).collect();
        if terms.is_empty() {
            return;
        }
        for c in candidates.iter_mut() {
            let title = c.title.to_lowercase();
            let hits = terms.iter().filter(|t| title.contains(t.as_str())).count();
            c.score *= 1.0 + self.boost * hits as f64 / terms.len() as f64;
        }
    }
}

pub fn create_reranker(config: &RetrievalConfig) -> Result<Box<dyn Reranker>> {
    match config.rerank.as_str() {
        "none" => Ok(Box::new(NoRerank)),
        "hybrid" => Ok(Box::new(HybridRerank {
            alpha: config.hybrid_alpha,
        })),
        "keyword_boost" => Ok(Box::new(KeywordBoost { boost: 0.5 })),
        other => bail!(
            "Unknown reranker: '{}'. Available: none, hybrid, keyword_boost",
            other
        ),
    }
}

/// Min-max normalize to [0, 1]. A constant input maps to all ones.
pub(crate) fn min_max(scores: &[f64]) -> Vec<f64> {
    let lo = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| {
            if (hi - lo).abs() < f64::EPSILON {
                1.0
            } else {
                (s - lo) / (hi - lo)
            }
        })
        .collect()
}
