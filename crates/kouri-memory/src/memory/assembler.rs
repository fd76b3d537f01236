//! Context Assembler
//!
//! Lays out the final prompt context:
//!
//! 1. system instructions
//! 2. core memory (when present)
//! 3. retrieved summaries, oldest first
//! 4. retrieved and recent raw turns, chronological
//! 5. the live user query
//!
//! The result never exceeds `max_context_tokens`. On overflow the oldest
//! summaries go first, then the oldest turns, then core memory; a non-fatal
//! `ContextTruncated` signal is logged and flagged on the result.

use serde::{Deserialize, Serialize};

use super::retriever::Retrieval;
use super::types::Role;
use crate::config::AssemblerConfig;
use crate::utils::{estimate_tokens, truncate_tail_to_tokens, truncate_to_tokens};

const CORE_HEADER: &str = "[Core memory]";
const SUMMARY_HEADER: &str = "[Earlier conversation]";
const TURNS_HEADER: &str = "[Recent conversation]";
const SECTION_SEPARATOR: &str = "\n\n";

/// Final context handed to the reply pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub text: String,
    pub token_count: usize,
    /// Set when anything was dropped or cut to fit the bound
    pub truncated: bool,
    pub summaries_included: usize,
    pub turns_included: usize,
    pub summaries_dropped: usize,
    pub turns_dropped: usize,
    pub core_memory_included: bool,
}

fn render(
    system: &str,
    core: Option<&str>,
    summaries: &[String],
    turns: &[String],
    query_line: &str,
) -> String {
    let mut sections = vec![system.to_string()];
    if let Some(core) = core {
        sections.push(core.to_string());
    }
    if !summaries.is_empty() {
        sections.push(format!("{SUMMARY_HEADER}\n{}", summaries.join("\n")));
    }
    if !turns.is_empty() {
        sections.push(format!("{TURNS_HEADER}\n{}", turns.join("\n")));
    }
    sections.push(query_line.to_string());
    sections.join(SECTION_SEPARATOR)
}

/// Builds bounded prompt contexts
pub struct ContextAssembler {
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self { config }
    }

    /// Assemble the context for one reply
    pub fn assemble(
        &self,
        conversation_id: &str,
        core_memory: Option<&str>,
        retrieval: &Retrieval,
        query: &str,
    ) -> AssembledContext {
        let max = self.config.max_context_tokens;

        let mut system = self.config.system_instructions.trim().to_string();
        let mut query_line = format!("{}: {}", Role::User, query.trim());
        let mut core = core_memory
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| format!("{CORE_HEADER}\n{c}"));
        let mut summaries: Vec<String> = retrieval
            .summaries
            .iter()
            .map(|s| format!("- {}", s.text))
            .collect();
        let mut turns: Vec<String> = retrieval.turns.iter().map(|t| t.text.clone()).collect();

        let mut truncated = false;
        let mut summaries_dropped = 0;
        let mut turns_dropped = 0;

        let mut text = render(&system, core.as_deref(), &summaries, &turns, &query_line);
        while estimate_tokens(&text) > max {
            truncated = true;
            if !summaries.is_empty() {
                summaries.remove(0);
                summaries_dropped += 1;
            } else if !turns.is_empty() {
                turns.remove(0);
                turns_dropped += 1;
            } else if core.is_some() {
                core = None;
            } else {
                // Only system and query remain: the query keeps its end and at
                // most half the budget, the system text is cut to the rest
                let available = max.saturating_sub(estimate_tokens(SECTION_SEPARATOR));
                let query_budget = estimate_tokens(&query_line).min(available - available / 2);
                query_line = truncate_tail_to_tokens(&query_line, query_budget);
                system = truncate_to_tokens(&system, available - estimate_tokens(&query_line));
                text = render(&system, None, &[], &[], &query_line);
                break;
            }
            text = render(&system, core.as_deref(), &summaries, &turns, &query_line);
        }

        let core_memory_included = core.is_some();
        let token_count = estimate_tokens(&text);

        if truncated {
            tracing::warn!(
                signal = "ContextTruncated",
                conversation_id = %conversation_id,
                summaries_dropped = summaries_dropped,
                turns_dropped = turns_dropped,
                core_memory_dropped = core_memory.is_some() && !core_memory_included,
                max_tokens = max,
                "Context truncated to fit bound"
            );
        }

        AssembledContext {
            text,
            token_count,
            truncated,
            summaries_included: summaries.len(),
            turns_included: turns.len(),
            summaries_dropped,
            turns_dropped,
            core_memory_included,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::retriever::RetrievedItem;
    use crate::memory::types::SourceRef;

    fn item(source: SourceRef, text: &str) -> RetrievedItem {
        RetrievedItem {
            source,
            role: None,
            text: text.to_string(),
            token_count: estimate_tokens(text),
            score: None,
            recency: source.id,
            order_key: source.id,
        }
    }

    fn retrieval() -> Retrieval {
        Retrieval {
            summaries: vec![
                item(SourceRef::summary(1), "They met at a bookstore."),
                item(SourceRef::summary(2), "They argued about cilantro."),
            ],
            turns: vec![
                item(SourceRef::turn(40), "user: I finished the novel"),
                item(SourceRef::turn(41), "assistant: How did it end?"),
            ],
            token_count: 0,
            degraded: false,
        }
    }

    fn assembler(max_context_tokens: usize) -> ContextAssembler {
        ContextAssembler::new(AssemblerConfig {
            system_instructions: "You are Kouri.".into(),
            max_context_tokens,
        })
    }

    #[test]
    fn test_layout_order() {
        let ctx = assembler(3000).assemble("a:1", Some("Likes novels."), &retrieval(), "It was sad");
        assert!(ctx.text.starts_with("You are Kouri."));
        assert!(ctx.text.ends_with("user: It was sad"));
        assert!(!ctx.truncated);

        let core = ctx.text.find("Likes novels.").unwrap();
        let bookstore = ctx.text.find("bookstore").unwrap();
        let cilantro = ctx.text.find("cilantro").unwrap();
        let novel = ctx.text.find("finished the novel").unwrap();
        let end = ctx.text.find("How did it end").unwrap();
        assert!(core < bookstore && bookstore < cilantro && cilantro < novel && novel < end);
        assert_eq!(ctx.summaries_included, 2);
        assert_eq!(ctx.turns_included, 2);
        assert!(ctx.core_memory_included);
    }

    #[test]
    fn test_empty_retrieval() {
        let ctx = assembler(3000).assemble("a:1", None, &Retrieval::default(), "hi");
        assert_eq!(ctx.text, "You are Kouri.\n\nuser: hi");
        assert!(!ctx.core_memory_included);
    }

    #[test]
    fn test_overflow_drops_oldest_summary_first() {
        let full = assembler(3000).assemble("a:1", None, &retrieval(), "It was sad");
        let tight = assembler(full.token_count - 2).assemble("a:1", None, &retrieval(), "It was sad");

        assert!(tight.truncated);
        assert!(tight.token_count <= full.token_count - 2);
        assert_eq!(tight.summaries_dropped, 1);
        assert!(!tight.text.contains("bookstore"));
        assert!(tight.text.contains("cilantro"));
        assert_eq!(tight.turns_included, 2);
    }

    #[test]
    fn test_overflow_then_drops_oldest_turns() {
        let ctx = assembler(20).assemble("a:1", Some("Likes novels."), &retrieval(), "It was sad");
        assert!(ctx.truncated);
        assert!(ctx.token_count <= 20);
        assert_eq!(ctx.summaries_included, 0);
        assert!(ctx.text.starts_with("You are Kouri."));
        assert!(ctx.text.ends_with("user: It was sad"));
    }

    #[test]
    fn test_bound_holds_for_huge_query() {
        let query = "长".repeat(500);
        let ctx = assembler(50).assemble("a:1", Some("core"), &retrieval(), &query);
        assert!(ctx.truncated);
        assert!(ctx.token_count <= 50);
        assert!(ctx.text.starts_with("You are"));
        assert!(ctx.text.ends_with('长'));
    }
}
