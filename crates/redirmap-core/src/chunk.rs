use crate::{Error, MatchChunk, Result};

/// Split `old_urls` into consecutive batches of `chunk_size`, each paired with the first
/// `max_candidates` entries of `new_urls`.
///
/// Pure partitioning: no reordering, no deduplication.
pub fn chunk(
    old_urls: &[String],
    new_urls: &[String],
    chunk_size: usize,
    max_candidates: usize,
) -> Result<Vec<MatchChunk>> {
    if chunk_size == 0 {
        return Err(Error::InvalidInput("chunk_size must be > 0".to_string()));
    }
    if max_candidates == 0 {
        return Err(Error::InvalidInput("max_candidates must be > 0".to_string()));
    }

    let candidates = &new_urls[..new_urls.len().min(max_candidates)];
    Ok(old_urls
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, sources)| MatchChunk {
            index,
            source_urls: sources.to_vec(),
            candidate_targets: candidates.to_vec(),
        })
        .collect())
}
