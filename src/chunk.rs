//! Bounded chunking of bulk collections
//!
//! A single event can embed hundreds of records (students, lesson members,
//! packages). These helpers split `[0, total)` into consecutive half-open
//! ranges of at most `max_chunk` items and process them in order.

use std::future::Future;
use std::ops::Range;
use thiserror::Error;

/// Default number of records processed per chunk
pub const MAX_RECORD_PROCESS_PER_TIME: usize = 500;

/// Errors from chunked processing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError<E> {
    /// `max_chunk` was zero
    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,

    /// The per-chunk function failed
    #[error("{0}")]
    Handler(E),
}

impl<E> ChunkError<E> {
    /// The handler error, if that is what failed
    pub fn into_handler(self) -> Option<E> {
        match self {
            ChunkError::Handler(e) => Some(e),
            ChunkError::InvalidChunkSize => None,
        }
    }
}

/// Iterator over consecutive `[start, end)` ranges covering `[0, total)`
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    next: usize,
    total: usize,
    max_chunk: usize,
}

impl Iterator for ChunkRanges {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.next >= self.total {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.max_chunk).min(self.total);
        self.next = end;
        Some(start..end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next).div_ceil(self.max_chunk);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkRanges {}

/// Ranges of at most `max_chunk` items covering `[0, total)`
pub fn chunk_ranges<E>(total: usize, max_chunk: usize) -> Result<ChunkRanges, ChunkError<E>> {
    if max_chunk == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }
    Ok(ChunkRanges {
        next: 0,
        total,
        max_chunk,
    })
}

/// Call `f(start, end)` for every chunk, in order
///
/// Stops at the first error and returns it unchanged. Chunks already
/// processed are not rolled back, so `f` must tolerate a partial run.
pub fn chunk_handler<E, F>(total: usize, max_chunk: usize, mut f: F) -> Result<(), ChunkError<E>>
where
    F: FnMut(usize, usize) -> Result<(), E>,
{
    for range in chunk_ranges(total, max_chunk)? {
        f(range.start, range.end).map_err(ChunkError::Handler)?;
    }
    Ok(())
}

/// Async form of [`chunk_handler`]
pub async fn chunk_handler_async<E, F, Fut>(
    total: usize,
    max_chunk: usize,
    mut f: F,
) -> Result<(), ChunkError<E>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    for range in chunk_ranges(total, max_chunk)? {
        f(range.start, range.end).await.map_err(ChunkError::Handler)?;
    }
    Ok(())
}
