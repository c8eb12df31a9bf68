//! Splits claimable responses into analysis chunks and chunks into waves.

use uuid::Uuid;

use crate::models::Response;

const HEAVY_TEXT: usize = 500;
const MEDIUM_TEXT: usize = 200;

/// Chunk size from mean text weight: long responses travel alone.
pub fn chunk_size(weights: &[usize]) -> usize {
  if weights.is_empty() {
    return 1;
  }
  let mean = weights.iter().sum::<usize>() / weights.len();
  let size = if mean > HEAVY_TEXT {
    1
  } else if mean > MEDIUM_TEXT {
    3
  } else {
    5
  };
  size.min(weights.len())
}

/// Chunks of response ids, in input order. Every id lands in exactly one chunk.
pub fn plan_chunks(items: &[Response]) -> Vec<Vec<Uuid>> {
  let weights: Vec<usize> = items.iter().map(Response::text_weight).collect();
  let size = chunk_size(&weights);
  items.chunks(size).map(|chunk| chunk.iter().map(|r| r.id).collect()).collect()
}

/// Groups chunks into waves of at most `max_concurrency`, preserving order.
pub fn plan_waves(chunks: Vec<Vec<Uuid>>, max_concurrency: usize) -> Vec<Vec<Vec<Uuid>>> {
  let width = max_concurrency.max(1);
  let mut waves = Vec::new();
  let mut chunks = chunks.into_iter().peekable();
  while chunks.peek().is_some() {
    waves.push(chunks.by_ref().take(width).collect());
  }
  waves
}
