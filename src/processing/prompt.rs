//! Prompt scaffolding shared by every generation call.
//!
//! Only the structure lives here: where the chunk text, subject and case background go. The
//! wording is deliberately generic.

use std::fmt::Write as _;

/// Shared context embedded in every request for one batch of documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptContext {
    /// Name or identifier of the person the documents concern.
    pub subject: Option<String>,
    /// Free-form case background supplied by the author.
    pub case_background: Option<String>,
}

impl PromptContext {
    /// Context with a subject and optional background.
    pub fn new(subject: Option<String>, case_background: Option<String>) -> Self {
        Self {
            subject,
            case_background,
        }
    }

    fn preamble(&self) -> String {
        let mut out = String::new();
        if let Some(subject) = self.subject.as_deref() {
            let _ = writeln!(out, "Subject: {subject}");
        }
        if let Some(background) = self.case_background.as_deref() {
            let _ = writeln!(out, "Case background:\n{}", background.trim());
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// System prompt for summarization calls.
pub(crate) const SYSTEM_PROMPT: &str = "You summarize source documents for a forensic report \
author. Preserve names, dates, quantities and attributions exactly. Do not speculate beyond \
the source text.";

pub(crate) fn document_prompt(context: &PromptContext, document_id: &str, text: &str) -> String {
    format!(
        "{}Summarize the document \"{document_id}\" below.\n\n<document>\n{text}\n</document>",
        context.preamble()
    )
}

pub(crate) fn chunk_prompt(
    context: &PromptContext,
    document_id: &str,
    index: usize,
    total: usize,
    text: &str,
) -> String {
    format!(
        "{}This is part {index} of {total} of the document \"{document_id}\". Parts overlap \
slightly at their boundaries. Summarize this part only.\n\n<document_part>\n{text}\n\
</document_part>",
        context.preamble()
    )
}

pub(crate) fn merge_prompt(
    context: &PromptContext,
    document_id: &str,
    parts: usize,
    concatenated: &str,
) -> String {
    format!(
        "{}The following {parts} summaries cover consecutive parts of the document \
\"{document_id}\" in order. Combine them into one coherent summary, removing repetition \
caused by overlapping parts.\n\n<part_summaries>\n{concatenated}\n</part_summaries>",
        context.preamble()
    )
}

pub(crate) fn integration_prompt(
    context: &PromptContext,
    documents: usize,
    concatenated: &str,
) -> String {
    format!(
        "{}Below are summaries of {documents} source documents. Write an integrated analysis \
that reconciles them, noting agreements, contradictions and gaps.\n\n<summaries>\n\
{concatenated}\n</summaries>",
        context.preamble()
    )
}
