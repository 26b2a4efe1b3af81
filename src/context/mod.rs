// Context assembly
// Renders ranked search results into labelled blocks under a character budget


use tracing::debug;

use crate::index::SearchResult;

/// Marker appended when the top-ranked block had to be cut to fit
pub const TRUNCATION_MARKER: &str = "[truncated]";

const BLOCK_SEPARATOR: &str = "\n\n";
const UNKNOWN_SOURCE: &str = "unknown";

/// Context handed to the generator, with the results that went into it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssembledContext {
    pub context: String,
    /// Results rendered into `context`, in rank order
    pub used_results: Vec<SearchResult>,
    /// Whether the top-ranked block was cut short
    pub truncated: bool,
}

impl AssembledContext {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_results.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    max_context_chars: usize,
}

impl ContextAssembler {
    #[inline]
    pub const fn new(max_context_chars: usize) -> Self {
        Self { max_context_chars }
    }

    /// Append blocks in rank order until the next one would exceed the
    /// budget; that block and every lower-ranked one are dropped.
    ///
    /// If not even the top block fits, it is cut at a word boundary and
    /// marked with [`TRUNCATION_MARKER`], so the context is never empty
    /// while results exist.
    #[inline]
    pub fn assemble(&self, results: &[SearchResult]) -> AssembledContext {
        let mut context = String::new();
        let mut used = 0_usize;
        let mut used_results = Vec::new();

        for (rank, result) in results.iter().enumerate() {
            let block = render_block(rank + 1, result);
            let block_chars = block.chars().count();
            let needed = if used_results.is_empty() {
                block_chars
            } else {
                block_chars + BLOCK_SEPARATOR.len()
            };

            if used + needed > self.max_context_chars {
                if used_results.is_empty() {
                    debug!(
                        "Top block ({} chars) exceeds context budget of {}, truncating",
                        block_chars, self.max_context_chars
                    );
                    let budget = self
                        .max_context_chars
                        .saturating_sub(TRUNCATION_MARKER.len() + 1);
                    let head = cut_at_word_boundary(&block, budget).trim_end();
                    return AssembledContext {
                        context: format!("{}\n{}", head, TRUNCATION_MARKER),
                        used_results: vec![result.clone()],
                        truncated: true,
                    };
                }
                break;
            }

            if !used_results.is_empty() {
                context.push_str(BLOCK_SEPARATOR);
            }
            context.push_str(&block);
            used += needed;
            used_results.push(result.clone());
        }

        debug!(
            "Assembled context from {}/{} results ({} chars)",
            used_results.len(),
            results.len(),
            used
        );

        AssembledContext {
            context,
            used_results,
            truncated: false,
        }
    }
}

/// `[docN] (source: X)` header followed by the chunk content
#[inline]
pub fn render_block(rank: usize, result: &SearchResult) -> String {
    format!(
        "[doc{}] (source: {})\n{}",
        rank,
        result.source().unwrap_or(UNKNOWN_SOURCE),
        result.content().unwrap_or_default()
    )
}

/// Longest prefix of at most `max_chars` characters that ends on a word boundary
#[expect(
    clippy::string_slice,
    reason = "offsets come from char_indices and rfind"
)]
fn cut_at_word_boundary(text: &str, max_chars: usize) -> &str {
    let end = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);
    if end == text.len() {
        return text;
    }

    let head = &text[..end];
    // Keep the cut character if it is itself whitespace
    if text[end..].starts_with(char::is_whitespace) {
        return head;
    }
    match head.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => &head[..pos],
        _ => head,
    }
}
