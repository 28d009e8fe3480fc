//! Similarity search over a cache generation.
//!
//! Ranking is brute-force cosine similarity against every cached chunk,
//! sorted descending with ties kept in insertion order. When no query vector
//! can be produced, search degrades to an accent- and case-insensitive
//! substring match in document order.

use serde::Serialize;

use crate::semantic::cache::Generation;
use crate::semantic::embeddings::{EmbeddingClient, EmbeddingError};
use crate::semantic::preprocess::fold_for_match;
use crate::semantic::record::ChunkRecord;

/// Score of hits that were not ranked; what a similarity of 0 maps to.
pub const NEUTRAL_SCORE: f32 = 50.0;

/// How a result set was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Ordered by cosine similarity to the query embedding.
    Ranked,
    /// Substring matches in document order; no similarity available.
    Lexical,
    /// No query term; first chunks of the cache.
    Unranked,
    /// Nothing indexed yet. Not an error.
    CacheNotReady,
}

/// One result with full provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub source_document: String,
    pub source_link: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    /// Cosine similarity in [-1, 1]
    pub similarity: Option<f32>,
    /// Similarity rescaled to 0-100
    pub relevance: Option<f32>,
    /// `relevance` when ranked, `NEUTRAL_SCORE` otherwise
    pub score: f32,
}

impl SearchHit {
    fn new(record: &ChunkRecord, similarity: Option<f32>) -> Self {
        let relevance = similarity.map(relevance_percent);
        Self {
            chunk_id: record.chunk_id.clone(),
            source_document: record.source_document.clone(),
            source_link: record.source_link.clone(),
            chunk_index: record.chunk_index,
            total_chunks: record.total_chunks,
            text: record.text.clone(),
            similarity,
            relevance,
            score: relevance.unwrap_or(NEUTRAL_SCORE),
        }
    }

    /// Human readable position, e.g. "Section 2 of 5".
    pub fn section_label(&self) -> String {
        format!("Section {} of {}", self.chunk_index + 1, self.total_chunks)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub status: SearchStatus,
    pub query: Option<String>,
    pub generation: u64,
    pub total_hits: usize,
    pub message: String,
    pub hits: Vec<SearchHit>,
    /// Citation-style rendering of `hits`
    pub content: String,
}

impl SearchResponse {
    fn new(status: SearchStatus, query: Option<&str>, generation: u64, hits: Vec<SearchHit>) -> Self {
        let message = match status {
            SearchStatus::CacheNotReady => {
                "Cache is not warmed yet; run a warmup to index documents".to_string()
            }
            _ if hits.is_empty() => "No relevant sections found".to_string(),
            _ => format!("Found {} relevant section(s)", hits.len()),
        };

        Self {
            status,
            query: query.map(str::to_string),
            generation,
            total_hits: hits.len(),
            message,
            content: format_hits(&hits),
            hits,
        }
    }
}

/// Search `generation` for `query`, returning at most `top_k` hits.
pub fn search(
    generation: &Generation,
    embeddings: &EmbeddingClient,
    query: &str,
    top_k: usize,
) -> SearchResponse {
    let query = query.trim();
    let query_opt = (!query.is_empty()).then_some(query);

    if generation.is_empty() {
        return SearchResponse::new(SearchStatus::CacheNotReady, query_opt, generation.number(), vec![]);
    }

    if query.is_empty() {
        let hits = generation
            .records()
            .iter()
            .take(top_k)
            .map(|r| SearchHit::new(r, None))
            .collect();
        return SearchResponse::new(SearchStatus::Unranked, None, generation.number(), hits);
    }

    let query_vector = match embeddings.embed(query) {
        Ok(v) if v.len() == generation.dimensions() => Some(v),
        Ok(v) => {
            log::warn!(
                "query embedding has {} dimensions, cache has {}; using lexical match",
                v.len(),
                generation.dimensions()
            );
            None
        }
        Err(EmbeddingError::Unavailable(reason)) => {
            log::debug!("semantic search unavailable ({reason}); using lexical match");
            None
        }
        Err(e) => {
            log::warn!("query embedding failed: {e}; using lexical match");
            None
        }
    };

    let records = generation.records();
    let (status, hits) = match query_vector {
        Some(vector) => {
            let hits = rank(records, &vector, top_k)
                .into_iter()
                .map(|(idx, sim)| SearchHit::new(&records[idx], Some(sim)))
                .collect::<Vec<_>>();
            (SearchStatus::Ranked, hits)
        }
        None => {
            let hits = lexical_matches(records, query, top_k)
                .into_iter()
                .map(|idx| SearchHit::new(&records[idx], None))
                .collect();
            (SearchStatus::Lexical, hits)
        }
    };

    if let Some(best) = hits.first() {
        log::info!(
            "search '{}': {} hit(s), best {} ({})",
            query,
            hits.len(),
            best.source_document,
            best.section_label()
        );
    }

    SearchResponse::new(status, Some(query), generation.number(), hits)
}

/// Indices of the `top_k` records most similar to `query`, best first.
///
/// Uses a stable sort, so equal scores keep insertion order.
pub fn rank(records: &[ChunkRecord], query: &[f32], top_k: usize) -> Vec<(usize, f32)> {
    let query_norm = l2_norm(query);

    let mut scored: Vec<(usize, f32)> = records
        .iter()
        .enumerate()
        .map(|(idx, record)| (idx, cosine_similarity(query, &record.embedding, query_norm)))
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(top_k);
    scored
}

/// Indices of records whose text or document name contains `query`, in order.
pub fn lexical_matches(records: &[ChunkRecord], query: &str, top_k: usize) -> Vec<usize> {
    let needle = fold_for_match(query.trim());
    if needle.is_empty() {
        return vec![];
    }

    records
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            fold_for_match(&r.text).contains(&needle)
                || fold_for_match(&r.source_document).contains(&needle)
        })
        .map(|(idx, _)| idx)
        .take(top_k)
        .collect()
}

/// Map cosine similarity to a 0-100 relevance figure, monotonic in `sim`.
pub fn relevance_percent(sim: f32) -> f32 {
    ((sim + 1.0) / 2.0 * 100.0).clamp(0.0, 100.0)
}

/// Render hits as a citation list.
pub fn format_hits(hits: &[SearchHit]) -> String {
    let parts: Vec<String> = hits
        .iter()
        .map(|hit| {
            let mut out = format!("📄 **{}**", hit.source_document);
            if let Some(relevance) = hit.relevance {
                out.push_str(&format!(" (Relevance: {relevance:.1}%)"));
            }
            out.push_str(&format!("\n🔗 {}\n", hit.source_link));
            out.push_str(&format!("📍 {}\n\n", hit.section_label()));
            out.push_str(&hit.text);
            out.push('\n');
            out.push_str(&"=".repeat(60));
            out.push('\n');
            out
        })
        .collect();

    parts.join("\n")
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Zero-norm vectors score 0 against everything.
fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if query_norm < f32::EPSILON || target_norm < f32::EPSILON || query.len() != target.len() {
        return 0.0;
    }

    let dot: f32 = query.iter().zip(target).map(|(a, b)| a * b).sum();
    (dot / (query_norm * target_norm)).clamp(-1.0, 1.0)
}
