//! Paragraph-aligned, token-bounded chunking with overlap.
//!
//! Paragraphs are blank-line delimited and never split. The chunker accumulates
//! `probe_batch` paragraphs at a time and asks the [`TokenEstimator`] how large the candidate
//! is; once a candidate passes `max_chunk_tokens - reserved_tokens` it drops trailing paragraphs
//! back into the queue and closes the chunk. Each closed chunk seeds the next one with up to
//! `max_overlap_paragraphs` trailing paragraphs, shrunk until the overlap estimate fits
//! [`TokenBudget::overlap_limit`].
//!
//! A single paragraph larger than the budget is emitted as its own oversized chunk and logged;
//! it is never cut mid-paragraph.

use super::types::{Chunk, ChunkingError, Document, TokenBudget};
use crate::provider::ProviderCapability;
use crate::tokens::{TokenCount, TokenEstimator};
use tokio_util::sync::CancellationToken;

/// Splits documents into ordered, overlapping chunks sized for one provider.
pub struct DocumentChunker<'a> {
    estimator: &'a TokenEstimator,
    provider: &'a dyn ProviderCapability,
    budget: TokenBudget,
}

impl<'a> DocumentChunker<'a> {
    /// Chunker measuring token sizes against `provider`.
    pub fn new(
        estimator: &'a TokenEstimator,
        provider: &'a dyn ProviderCapability,
        budget: TokenBudget,
    ) -> Self {
        Self {
            estimator,
            provider,
            budget,
        }
    }

    /// Split `document` into 1-indexed chunks in document order.
    ///
    /// Every call re-splits from scratch. Cancellation is checked before each token probe.
    pub async fn chunk(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chunk>, ChunkingError> {
        let limit = self.budget.chunk_limit();
        if limit == 0 {
            return Err(ChunkingError::InvalidBudget {
                max_chunk_tokens: self.budget.max_chunk_tokens,
                reserved_tokens: self.budget.reserved_tokens,
            });
        }
        let paragraphs = split_paragraphs(&document.raw_text);
        if paragraphs.is_empty() {
            return Err(ChunkingError::EmptyDocument(document.id.clone()));
        }

        let total = paragraphs.len();
        let batch = self.budget.probe_batch.max(1);
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut overlap = 0;
        let mut next = 0;

        while next < total {
            let mut end = next;
            let mut estimate;
            loop {
                end = (end + batch).min(total);
                estimate = self.probe(&paragraphs[start..end], cancel).await?;
                if estimate.tokens > limit || end == total {
                    break;
                }
            }

            while estimate.tokens > limit && end - start - overlap > 1 {
                end -= 1;
                estimate = self.probe(&paragraphs[start..end], cancel).await?;
            }
            while estimate.tokens > limit && overlap > 0 {
                start += 1;
                overlap -= 1;
                estimate = self.probe(&paragraphs[start..end], cancel).await?;
            }

            let index = chunks.len() + 1;
            if estimate.tokens > limit {
                tracing::warn!(
                    document = %document.id,
                    chunk = index,
                    estimated_tokens = estimate.tokens,
                    limit,
                    "Single paragraph exceeds chunk budget; emitting oversized chunk"
                );
            }
            tracing::debug!(
                document = %document.id,
                chunk = index,
                paragraphs = end - start,
                overlap_paragraphs = overlap,
                estimated_tokens = estimate.tokens,
                approximate = estimate.approximate,
                "Closed chunk"
            );
            chunks.push(Chunk {
                index,
                text: paragraphs[start..end].join("\n\n"),
                estimated_tokens: estimate.tokens,
                approximate: estimate.approximate,
                paragraph_range: start..end,
                overlap_paragraphs: overlap,
            });

            next = end;
            if next < total {
                overlap = self.overlap_seed(&paragraphs[start..end], cancel).await?;
                start = end - overlap;
            }
        }

        tracing::info!(
            document = %document.id,
            chunks = chunks.len(),
            paragraphs = total,
            limit,
            "Chunked document"
        );
        Ok(chunks)
    }

    /// Trailing paragraphs of `closed` to repeat at the start of the next chunk.
    async fn overlap_seed(
        &self,
        closed: &[String],
        cancel: &CancellationToken,
    ) -> Result<usize, ChunkingError> {
        let limit = self.budget.overlap_limit();
        if limit == 0 {
            return Ok(0);
        }
        let mut count = self
            .budget
            .max_overlap_paragraphs
            .min(closed.len().saturating_sub(1));
        while count > 0 {
            let tail = &closed[closed.len() - count..];
            if self.probe(tail, cancel).await?.tokens <= limit {
                break;
            }
            count -= 1;
        }
        Ok(count)
    }

    async fn probe(
        &self,
        paragraphs: &[String],
        cancel: &CancellationToken,
    ) -> Result<TokenCount, ChunkingError> {
        if cancel.is_cancelled() {
            return Err(ChunkingError::Cancelled);
        }
        Ok(self
            .estimator
            .estimate(self.provider, &paragraphs.join("\n\n"))
            .await)
    }
}

/// Split text into blank-line delimited paragraphs, dropping empty ones.
pub(crate) fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::StaticProvider;
    use std::time::Duration;

    fn budget() -> TokenBudget {
        TokenBudget {
            max_chunk_tokens: 60,
            reserved_tokens: 10,
            overlap_tokens: 20,
            merge_threshold_tokens: 1_000,
            max_overlap_paragraphs: 5,
            probe_batch: 2,
        }
    }

    fn paragraph(tag: usize, words: usize) -> String {
        (0..words)
            .map(|i| format!("p{tag}w{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn document(sizes: &[usize]) -> Document {
        let text = sizes
            .iter()
            .enumerate()
            .map(|(tag, words)| paragraph(tag, *words))
            .collect::<Vec<_>>()
            .join("\n\n");
        Document::new("doc", "doc.md", text)
    }

    fn estimator() -> TokenEstimator {
        TokenEstimator::new(4.0, Duration::from_secs(5))
    }

    #[test]
    fn split_paragraphs_handles_blank_runs_and_crlf() {
        let paragraphs = split_paragraphs("a\nb\n\n\n  \n c\r\n\r\nd\n");
        assert_eq!(paragraphs, vec!["a\nb", " c", "d"]);
        assert!(split_paragraphs(" \n\n\t\n").is_empty());
    }

    #[tokio::test]
    async fn closes_chunks_at_budget_and_carries_overlap() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let chunker = DocumentChunker::new(&estimator, &provider, budget());

        let chunks = chunker
            .chunk(&document(&[10; 6]), &CancellationToken::new())
            .await
            .expect("chunks");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 1);
        assert_eq!(chunks[0].paragraph_range, 0..5);
        assert_eq!(chunks[0].estimated_tokens, 50);
        assert_eq!(chunks[0].overlap_paragraphs, 0);
        assert_eq!(chunks[1].index, 2);
        assert_eq!(chunks[1].paragraph_range, 3..6);
        assert_eq!(chunks[1].overlap_paragraphs, 2);
        assert!(chunks[1].text.starts_with("p3w0"));
    }

    #[tokio::test]
    async fn budget_order_and_overlap_invariants_hold() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let chunker = DocumentChunker::new(&estimator, &provider, budget());
        let sizes: Vec<usize> = (0..40).map(|i| 3 + (i * 7) % 11).collect();

        let chunks = chunker
            .chunk(&document(&sizes), &CancellationToken::new())
            .await
            .expect("chunks");

        assert!(chunks.len() > 2);
        let (last, rest) = chunks.split_last().expect("non-empty");
        for chunk in rest {
            assert!(chunk.estimated_tokens <= budget().chunk_limit());
        }
        assert_eq!(last.paragraph_range.end, sizes.len());
        for (position, pair) in chunks.windows(2).enumerate() {
            let (previous, current) = (&pair[0], &pair[1]);
            assert_eq!(current.index, position + 2);
            assert!(current.overlap_paragraphs <= 5);
            assert_eq!(
                current.paragraph_range.start + current.overlap_paragraphs,
                previous.paragraph_range.end,
                "no paragraph skipped or duplicated beyond overlap"
            );
            let overlap_words: usize = sizes
                [current.paragraph_range.start..previous.paragraph_range.end]
                .iter()
                .sum();
            assert!(overlap_words <= budget().overlap_limit());
        }
    }

    #[tokio::test]
    async fn oversized_paragraph_becomes_its_own_chunk() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let chunker = DocumentChunker::new(&estimator, &provider, budget());

        let chunks = chunker
            .chunk(&document(&[10, 100, 10]), &CancellationToken::new())
            .await
            .expect("chunks");

        let ranges: Vec<_> = chunks
            .iter()
            .map(|chunk| chunk.paragraph_range.clone())
            .collect();
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
        assert_eq!(chunks[1].estimated_tokens, 100);
    }

    #[tokio::test]
    async fn small_document_is_a_single_chunk() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let chunker = DocumentChunker::new(&estimator, &provider, budget());
        let chunks = chunker
            .chunk(&document(&[5, 5, 5]), &CancellationToken::new())
            .await
            .expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].estimated_tokens, 15);
    }

    #[tokio::test]
    async fn overlap_shrinks_to_half_the_chunk_limit() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let mut budget = budget();
        budget.overlap_tokens = 1_000;
        assert_eq!(budget.overlap_limit(), budget.chunk_limit() / 2);
        let chunker = DocumentChunker::new(&estimator, &provider, budget);

        // Five trailing 6-word paragraphs are 30 words, over the 25-word half budget.
        let chunks = chunker
            .chunk(&document(&[6; 14]), &CancellationToken::new())
            .await
            .expect("chunks");

        let shape: Vec<_> = chunks
            .iter()
            .map(|chunk| (chunk.paragraph_range.clone(), chunk.overlap_paragraphs))
            .collect();
        assert_eq!(shape, vec![(0..8, 0), (4..12, 4), (8..14, 4)]);
        for pair in chunks.windows(2) {
            let overlap_words = (pair[0].paragraph_range.end - pair[1].paragraph_range.start) * 6;
            assert!(overlap_words <= budget.chunk_limit() / 2);
        }
    }

    #[tokio::test]
    async fn overlap_drops_to_zero_when_one_paragraph_exceeds_half_budget() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let mut budget = budget();
        budget.overlap_tokens = 1_000;
        let chunker = DocumentChunker::new(&estimator, &provider, budget);

        let chunks = chunker
            .chunk(&document(&[10, 30, 30]), &CancellationToken::new())
            .await
            .expect("chunks");

        let shape: Vec<_> = chunks
            .iter()
            .map(|chunk| (chunk.paragraph_range.clone(), chunk.overlap_paragraphs))
            .collect();
        assert_eq!(shape, vec![(0..2, 0), (2..3, 0)]);
    }

    #[tokio::test]
    async fn zero_overlap_budget_disables_overlap() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let mut budget = budget();
        budget.overlap_tokens = 0;
        let chunker = DocumentChunker::new(&estimator, &provider, budget);
        let chunks = chunker
            .chunk(&document(&[10; 12]), &CancellationToken::new())
            .await
            .expect("chunks");
        assert!(chunks.iter().all(|chunk| chunk.overlap_paragraphs == 0));
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let chunker = DocumentChunker::new(&estimator, &provider, budget());
        let result = chunker
            .chunk(
                &Document::new("blank", "blank.md", "\n\n  \n".into()),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ChunkingError::EmptyDocument(id)) if id == "blank"));
    }

    #[tokio::test]
    async fn cancellation_stops_probing() {
        let provider = StaticProvider::new("words", 1_000);
        let estimator = estimator();
        let chunker = DocumentChunker::new(&estimator, &provider, budget());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = chunker.chunk(&document(&[10; 6]), &cancel).await;
        assert!(matches!(result, Err(ChunkingError::Cancelled)));
        assert_eq!(provider.count_calls(), 0);
    }
}
