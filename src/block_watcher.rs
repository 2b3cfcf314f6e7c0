use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

#[cfg(test)]
use mockall::automock;

/// Supplies the current chain tip to every decision point.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockProvider {
    async fn current_height(&self) -> u32;
}

/// Monotonic block-height cell, fed by the wallet's chain notifications.
pub struct BlockWatcher {
    current_height: Arc<Mutex<u32>>,
}

impl BlockWatcher {
    pub fn new(initial_height: u32) -> Self {
        Self {
            current_height: Arc::new(Mutex::new(initial_height)),
        }
    }

    /// Records a newly connected block. Heights never move backwards, so a
    /// stale or replayed notification is ignored.
    #[instrument(skip(self))]
    pub async fn new_block(&self, height: u32) {
        let mut current_height = self.current_height.lock().await;
        if height > *current_height {
            *current_height = height;
            debug!(blockheight = height, "blockheight updated");
        } else {
            trace!(blockheight = height, "no blockheight update");
        }
    }
}

#[async_trait]
impl BlockProvider for BlockWatcher {
    async fn current_height(&self) -> u32 {
        *self.current_height.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockProvider, BlockWatcher};

    #[tokio::test]
    async fn new_block_advances_height() {
        let watcher = BlockWatcher::new(100);
        watcher.new_block(101).await;
        assert_eq!(101, watcher.current_height().await);
    }

    #[tokio::test]
    async fn stale_block_is_ignored() {
        let watcher = BlockWatcher::new(100);
        watcher.new_block(99).await;
        assert_eq!(100, watcher.current_height().await);
    }
}
