
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use super::model::Block;
use crate::Result;

/// Single-pass, forward-only iterator over a backend result stream.
///
/// The stream owns its backend connection. When the stream is drained and
/// `close_on_exhaustion` is set, the stream is dropped right away, which releases
/// that connection. Re-scanning requires issuing the originating query again.
pub struct Cursor {
    rows: BoxStream<'static, Result<Block>>,
    exhausted: bool,
    close_on_exhaustion: bool,
    pulled: u64,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("exhausted", &self.exhausted)
            .field("close_on_exhaustion", &self.close_on_exhaustion)
            .field("pulled", &self.pulled)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    #[inline]
    pub fn new(rows: BoxStream<'static, Result<Block>>, close_on_exhaustion: bool) -> Self {
        Self {
            rows,
            exhausted: false,
            close_on_exhaustion,
            pulled: 0,
        }
    }

    /// A cursor over blocks that are already in memory.
    #[inline]
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Self::new(stream::iter(blocks.into_iter().map(Ok)).boxed(), true)
    }

    #[inline]
    pub fn empty() -> Self {
        Self::from_blocks(Vec::new())
    }

    /// Advance one row. Returns `None` once the stream is exhausted.
    pub async fn pull_one(&mut self) -> Result<Option<Block>> {
        if self.exhausted {
            return Ok(None);
        }

        match self.rows.next().await {
            Some(Ok(block)) => {
                self.pulled += 1;
                Ok(Some(block))
            }
            Some(Err(e)) => {
                self.exhausted = true;
                self.close();
                Err(e)
            }
            None => {
                debug!("Cursor exhausted after {} rows", self.pulled);
                self.exhausted = true;
                if self.close_on_exhaustion {
                    self.close();
                }
                Ok(None)
            }
        }
    }

    /// Pull up to `size` rows. An empty batch means the cursor is exhausted.
    pub async fn pull_batch(&mut self, size: usize) -> Result<Vec<Block>> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            match self.pull_one().await? {
                Some(block) => batch.push(block),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Drain the remainder into memory.
    pub async fn pull_all(&mut self) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        while let Some(block) = self.pull_one().await? {
            blocks.push(block);
        }
        Ok(blocks)
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Rows returned so far
    #[inline]
    pub fn pulled(&self) -> u64 {
        self.pulled
    }

    /// Drop the underlying stream and the backend resource it holds.
    #[inline]
    pub fn close(&mut self) {
        self.rows = stream::empty().boxed();
    }
}
