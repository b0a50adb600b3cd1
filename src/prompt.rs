//! Instruction prompt assembly for the generative model.
//!
//! The template uses the Llama 3 chat delimiters expected by the configured
//! llama.cpp server. Changing the model family means changing this template.

use crate::models::RetrievedFragment;

/// Marker appended to a fragment that was cut to the snippet length.
pub const ELLIPSIS: &str = "...";

/// Builds prompts from a question and ranked fragments.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    max_fragments: usize,
    snippet_chars: usize,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new(3, 400)
    }
}

impl PromptAssembler {
    pub fn new(max_fragments: usize, snippet_chars: usize) -> Self {
        Self {
            max_fragments,
            snippet_chars,
        }
    }

    /// Assemble the prompt from the top `max_fragments` of `ranked`, which
    /// must already be filtered and sorted ascending by distance.
    pub fn build(&self, question: &str, ranked: &[RetrievedFragment]) -> String {
        let context = ranked
            .iter()
            .take(self.max_fragments)
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "[Source {}]\n{}",
                    i + 1,
                    truncate_chars(r.fragment.text.trim(), self.snippet_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\
             \n\
             You are a helpful assistant. Answer questions using only the provided documents.\n\
             \n\
             Documents:\n\
             {context}\n\
             \n\
             Rules:\n\
             - Answer directly based on the documents\n\
             - Keep answers concise\n\
             - Don't repeat the question\n\
             - If information is not in documents, say \"I don't have that information\"\n\
             <|eot_id|><|start_header_id|>user<|end_header_id|>\n\
             \n\
             {question}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\
             \n"
        )
    }
}

/// Cut `text` to at most `max_chars` characters, appending [`ELLIPSIS`] when
/// anything was removed.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], ELLIPSIS),
        None => text.to_string(),
    }
}
