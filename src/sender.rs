use async_trait::async_trait;
use lightning_invoice::{PaymentSecret, RouteHint};
use rand::RngCore;
use secp256k1::PublicKey;

use crate::messages::{ChannelId, FailureMessage, FullPaymentTag};

#[cfg(test)]
use mockall::automock;

/// Multipart send request handed to the outgoing-payment sender.
#[derive(Clone, Debug, PartialEq)]
pub struct SendMultiPart {
    pub tag: FullPaymentTag,
    /// Largest route cltv delta the sender may use.
    pub max_cltv_delta: u32,
    pub destination: PublicKey,
    /// Total advertised inside the outgoing onion.
    pub onion_total_msat: u64,
    /// Total the parts must add up to.
    pub actual_total_msat: u64,
    /// Upper bound on fees spent across all parts.
    pub fee_reserve_msat: u64,
    pub outgoing_cltv: u32,
    pub allowed_channels: Vec<ChannelId>,
    pub payment_secret: PaymentSecret,
    pub mode: RelayMode,
}

/// How the outgoing payment addresses its recipient.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayMode {
    /// The recipient is a plain MPP-capable node reached directly, possibly
    /// through invoice routing hints.
    Mpp { assisted_edges: Vec<RouteHint> },
    /// The recipient is another trampoline node which gets the forwarded
    /// onion as-is.
    Trampoline { next_onion: Vec<u8> },
}

/// Terminal outcome of an outgoing send once every part has failed.
#[derive(Clone, Debug)]
pub struct OutgoingPaymentSenderData {
    pub tag: FullPaymentTag,
    pub failures: Vec<SendFailure>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SendFailure {
    /// A node along some route returned a failure.
    Remote {
        origin_node: PublicKey,
        message: FailureMessage,
    },
    /// A part never left this node.
    Local { reason: LocalSendFailure },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalSendFailure {
    NoRoutesFound,
    ChannelOffline,
    RunOutOfRetryAttempts,
}

/// Outgoing multipart payment sender. One sender FSM exists per payment tag
/// between `create_sender` and `remove_sender`; its terminal events reach the
/// incoming FSM through the registry, never as a synchronous call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymentSender {
    async fn create_sender(&self, tag: FullPaymentTag);
    async fn remove_sender(&self, tag: &FullPaymentTag);
    async fn send_multipart(&self, req: SendMultiPart);

    /// Fee actually spent by the parts of this tag so far.
    async fn used_fee_msat(&self, tag: &FullPaymentTag) -> u64;
}

/// Fresh unpredictable payment secret for the outer layer of a
/// trampoline-to-trampoline relay. Never reused across tags.
pub fn random_payment_secret() -> PaymentSecret {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    PaymentSecret(random_bytes)
}

#[cfg(test)]
mod tests {
    use super::random_payment_secret;

    #[test]
    fn random_payment_secrets_do_not_repeat() {
        let first = random_payment_secret();
        let second = random_payment_secret();
        assert_ne!(first, second);
    }
}
