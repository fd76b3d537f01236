//! Retriever
//!
//! Ranks and packs memory for one reply: the recency floor of newest raw
//! turns first, then index candidates by descending score, all within a
//! token budget.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::index::MemoryIndex;
use super::store::MemoryStore;
use super::types::{Role, SourceKind, SourceRef, Turn};
use crate::config::RetrieverConfig;
use crate::utils::{estimate_tokens, truncate_to_tokens};
use crate::Result;

/// One packed memory item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub source: SourceRef,
    /// Speaker for turns, `None` for summaries
    pub role: Option<Role>,
    pub text: String,
    pub token_count: usize,
    /// Similarity score, `None` for recency-floor turns not matched by search
    pub score: Option<f32>,
    /// Turn id, or the last covered turn id for summaries
    pub recency: i64,
    /// Start of the covered range for summaries, the turn id otherwise
    pub order_key: i64,
}

impl RetrievedItem {
    fn from_turn(turn: &Turn, score: Option<f32>) -> Self {
        let text = turn.render();
        Self {
            source: SourceRef::turn(turn.id),
            role: Some(turn.role),
            token_count: estimate_tokens(&text),
            text,
            score,
            recency: turn.id,
            order_key: turn.id,
        }
    }
}

/// Packed retrieval result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    /// Summaries, oldest range first
    pub summaries: Vec<RetrievedItem>,
    /// Raw turns, chronological
    pub turns: Vec<RetrievedItem>,
    /// Total estimated tokens of all packed items
    pub token_count: usize,
    /// Whether the index search failed and only the floor was used
    pub degraded: bool,
}

impl Retrieval {
    pub fn len(&self) -> usize {
        self.summaries.len() + self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty() && self.turns.is_empty()
    }

    pub fn contains(&self, source: SourceRef) -> bool {
        self.summaries
            .iter()
            .chain(self.turns.iter())
            .any(|item| item.source == source)
    }
}

/// Selects memory for a reply within a token budget
pub struct Retriever {
    store: MemoryStore,
    index: Arc<MemoryIndex>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(store: MemoryStore, index: Arc<MemoryIndex>, config: RetrieverConfig) -> Self {
        Self {
            store,
            index,
            config,
        }
    }

    /// Retrieve memory relevant to `query` for one conversation
    ///
    /// Ordering is deterministic: the floor is packed newest first, then
    /// candidates by descending score with ties going to the newer source.
    pub async fn retrieve(&self, conversation_id: &str, query: &str) -> Result<Retrieval> {
        let budget = self.config.token_budget;
        let active = self.store.active_turns(conversation_id).await?;
        let active_ids: HashSet<i64> = active.iter().map(|t| t.id).collect();

        let mut retrieval = Retrieval::default();
        let mut seen: HashSet<SourceRef> = HashSet::new();
        let mut used = 0usize;
        let mut packed: Vec<RetrievedItem> = Vec::new();

        // Recency floor, newest first; the newest turn always gets in
        let floor_start = active.len().saturating_sub(self.config.recency_floor);
        for turn in active[floor_start..].iter().rev() {
            let mut item = RetrievedItem::from_turn(turn, None);
            if used + item.token_count > budget {
                if !packed.is_empty() {
                    break;
                }
                item.text = truncate_to_tokens(&item.text, budget);
                item.token_count = estimate_tokens(&item.text);
            }
            used += item.token_count;
            seen.insert(item.source);
            packed.push(item);
        }

        let hits = match self.index.search(query, self.config.top_k, conversation_id).await {
            Ok(hits) => hits,
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Index search unavailable, using recency floor only"
                );
                retrieval.degraded = true;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        // Index hits arrive sorted by score desc, recency desc
        for hit in hits {
            if hit.score < self.config.min_score {
                continue;
            }
            if seen.contains(&hit.source) {
                if let Some(item) = packed.iter_mut().find(|i| i.source == hit.source) {
                    item.score = Some(hit.score);
                }
                continue;
            }

            let item = match hit.source.kind {
                SourceKind::Turn => {
                    if !active_ids.contains(&hit.source.id) {
                        continue;
                    }
                    match self.store.get(hit.source.id).await? {
                        Some(turn) => RetrievedItem::from_turn(&turn, Some(hit.score)),
                        None => continue,
                    }
                }
                SourceKind::Summary => match self.store.get_summary(hit.source.id).await? {
                    Some(summary) if summary.conversation_id == conversation_id => RetrievedItem {
                        source: hit.source,
                        role: None,
                        token_count: estimate_tokens(&summary.text),
                        text: summary.text,
                        score: Some(hit.score),
                        recency: summary.end_turn_id,
                        order_key: summary.start_turn_id,
                    },
                    _ => continue,
                },
            };

            if used + item.token_count > budget {
                continue;
            }
            used += item.token_count;
            seen.insert(item.source);
            packed.push(item);
        }

        for item in packed {
            match item.source.kind {
                SourceKind::Summary => retrieval.summaries.push(item),
                SourceKind::Turn => retrieval.turns.push(item),
            }
        }
        retrieval.summaries.sort_by_key(|i| i.order_key);
        retrieval.turns.sort_by_key(|i| i.order_key);
        retrieval.token_count = used;

        tracing::debug!(
            conversation_id = %conversation_id,
            summaries = retrieval.summaries.len(),
            turns = retrieval.turns.len(),
            tokens = used,
            budget = budget,
            "Memory retrieved"
        );
        Ok(retrieval)
    }
}
