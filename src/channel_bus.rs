use async_trait::async_trait;

use crate::messages::{ChannelId, FailCommand, FulfillCommand};

#[cfg(test)]
use mockall::automock;

/// Routes settlement commands back to the channel holding each htlc.
///
/// Commands are fire-and-forget: the channel layer is idempotent under
/// duplicate fulfill or fail for the same htlc, and the FSMs re-emit pending
/// commands on every snapshot while finalizing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelBus {
    async fn fulfill(&self, cmd: FulfillCommand);
    async fn fail(&self, cmd: FailCommand);

    /// Channels currently usable for outgoing parts.
    async fn usable_channels(&self) -> Vec<ChannelId>;
}
