use std::collections::HashMap;
use std::sync::Arc;

use lightning_invoice::{PaymentSecret, RouteHint};
use secp256k1::hashes::sha256;
use secp256k1::PublicKey;

use crate::sender::OutgoingPaymentSenderData;

/// Distinguishes payments that terminate at this node from payments that
/// transit it toward another recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaymentTagKind {
    FinalIncoming,
    TrampolineRouted,
}

/// Identifier of one logical payment. Two payments reusing a payment hash are
/// still distinct as long as their secret or kind differs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FullPaymentTag {
    pub payment_hash: sha256::Hash,
    pub payment_secret: PaymentSecret,
    pub kind: PaymentTagKind,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub [u8; 32]);

impl std::fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A decoded, validated incoming htlc whose final destination is this node.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalHtlc {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub payment_hash: sha256::Hash,
    pub payment_secret: PaymentSecret,
    pub amount_msat: u64,
    /// Absolute block height after which the sender can reclaim the htlc.
    pub cltv_expiry: u32,
    /// Total amount the whole multipart set is expected to add up to.
    pub total_msat: u64,
}

impl LocalHtlc {
    pub fn full_tag(&self) -> FullPaymentTag {
        FullPaymentTag {
            payment_hash: self.payment_hash,
            payment_secret: self.payment_secret.clone(),
            kind: PaymentTagKind::FinalIncoming,
        }
    }
}

/// A decoded, validated incoming htlc that asks this node to relay onward on
/// behalf of the sender.
#[derive(Clone, Debug, PartialEq)]
pub struct TrampolineHtlc {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub payment_hash: sha256::Hash,
    pub outer_secret: PaymentSecret,
    pub amount_msat: u64,
    pub cltv_expiry: u32,
    /// Total of the incoming multipart set, from the outer payload.
    pub outer_total_msat: u64,
    pub forward: TrampolineForward,
    /// Onion packet for the next trampoline hop, opaque to us.
    pub next_onion: Vec<u8>,
}

impl TrampolineHtlc {
    pub fn full_tag(&self) -> FullPaymentTag {
        FullPaymentTag {
            payment_hash: self.payment_hash,
            payment_secret: self.outer_secret.clone(),
            kind: PaymentTagKind::TrampolineRouted,
        }
    }
}

/// Inner payload of a trampoline htlc: what the sender asks us to forward.
#[derive(Clone, Debug, PartialEq)]
pub struct TrampolineForward {
    pub amount_to_forward_msat: u64,
    pub outgoing_cltv: u32,
    pub outgoing_node_id: PublicKey,
    /// Present when the final recipient is a plain MPP-capable node rather
    /// than another trampoline.
    pub payment_secret: Option<PaymentSecret>,
    pub invoice_features: Option<Vec<u8>>,
    pub routing_hints: Vec<RouteHint>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IncomingHtlc {
    Local(LocalHtlc),
    Trampoline(TrampolineHtlc),
}

impl IncomingHtlc {
    pub fn full_tag(&self) -> FullPaymentTag {
        match self {
            IncomingHtlc::Local(htlc) => htlc.full_tag(),
            IncomingHtlc::Trampoline(htlc) => htlc.full_tag(),
        }
    }
}

/// Read-only view of one in-flight outgoing part.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingAttempt {
    pub channel_id: ChannelId,
    pub amount_msat: u64,
}

/// The wallet's periodic consistency snapshot: every unresolved htlc, grouped
/// by payment tag. Lists are unordered but stable within one snapshot.
#[derive(Clone, Debug, Default)]
pub struct InFlightPayments {
    pub incoming: HashMap<FullPaymentTag, Vec<IncomingHtlc>>,
    pub outgoing: HashMap<FullPaymentTag, Vec<OutgoingAttempt>>,
}

impl InFlightPayments {
    pub fn contains(&self, tag: &FullPaymentTag) -> bool {
        self.incoming.contains_key(tag) || self.outgoing.contains_key(tag)
    }

    pub fn local_for(&self, tag: &FullPaymentTag) -> Vec<LocalHtlc> {
        self.incoming
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|add| match add {
                IncomingHtlc::Local(htlc) => Some(htlc.clone()),
                IncomingHtlc::Trampoline(_) => None,
            })
            .collect()
    }

    pub fn trampoline_for(&self, tag: &FullPaymentTag) -> Vec<TrampolineHtlc> {
        self.incoming
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|add| match add {
                IncomingHtlc::Trampoline(htlc) => Some(htlc.clone()),
                IncomingHtlc::Local(_) => None,
            })
            .collect()
    }

    pub fn outgoing_for(&self, tag: &FullPaymentTag) -> Vec<OutgoingAttempt> {
        self.outgoing.get(tag).cloned().unwrap_or_default()
    }
}

/// Inputs consumed by a payment FSM, linearized through its input queue.
#[derive(Clone, Debug)]
pub enum PaymentEvent {
    Snapshot(Arc<InFlightPayments>),
    /// Fine-grained arrival notification, resets the receive timeout.
    HtlcArrived,
    /// Self-delivered grace-period expiry.
    Timeout,
    /// All parts of the correlated outgoing payment have failed.
    SenderFailed(OutgoingPaymentSenderData),
    RemoteFulfill(RemoteFulfill),
}

/// Some outgoing part was fulfilled by the downstream peer.
#[derive(Clone)]
pub struct RemoteFulfill {
    pub payment_hash: sha256::Hash,
    pub preimage: Vec<u8>,
}

impl std::fmt::Debug for RemoteFulfill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "remote fulfill {{ payment_hash: {}, preimage: redacted }}",
            self.payment_hash
        )
    }
}

/// Upstream-facing failure, wire-compatible with BOLT4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureMessage {
    TemporaryNodeFailure,
    TrampolineFeeInsufficient,
    TrampolineExpiryTooSoon,
    IncorrectOrUnknownPaymentDetails { amount_msat: u64, height: u32 },
    PaymentTimeout,
}

const NODE: u16 = 0x2000;
const PERM: u16 = 0x4000;

impl FailureMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FailureMessage::TemporaryNodeFailure => (NODE | 2).to_be_bytes().to_vec(),
            FailureMessage::TrampolineFeeInsufficient => (NODE | 51).to_be_bytes().to_vec(),
            FailureMessage::TrampolineExpiryTooSoon => (NODE | 52).to_be_bytes().to_vec(),
            FailureMessage::IncorrectOrUnknownPaymentDetails { amount_msat, height } => {
                let mut s = (PERM | 15).to_be_bytes().to_vec();
                s.extend_from_slice(&amount_msat.to_be_bytes());
                s.extend_from_slice(&height.to_be_bytes());
                s
            }
            FailureMessage::PaymentTimeout => 23u16.to_be_bytes().to_vec(),
        }
    }
}

/// Claim one htlc on its channel by revealing the preimage.
#[derive(Clone, PartialEq)]
pub struct FulfillCommand {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub preimage: Vec<u8>,
}

impl std::fmt::Debug for FulfillCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fulfill {{ channel_id: {:?}, htlc_id: {}, preimage: redacted }}",
            self.channel_id, self.htlc_id
        )
    }
}

/// Reject one htlc on its channel with an upstream failure.
#[derive(Clone, Debug, PartialEq)]
pub struct FailCommand {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub failure: FailureMessage,
}

impl FailCommand {
    /// Shortcut for the generic rejection that leaks nothing about why.
    pub fn incorrect_details(
        channel_id: ChannelId,
        htlc_id: u64,
        amount_msat: u64,
        height: u32,
    ) -> Self {
        Self {
            channel_id,
            htlc_id,
            failure: FailureMessage::IncorrectOrUnknownPaymentDetails { amount_msat, height },
        }
    }
}

/// Fee and expiry policy enforced on relayed payments.
#[derive(Clone, Debug, PartialEq)]
pub struct TrampolineRoutingPolicy {
    pub fee_base_msat: u64,
    pub fee_proportional_millionths: u64,
    /// Exponent of the non-linear surcharge on the proportional part.
    pub exponent: f64,
    /// Decimal scale-down of the surcharge: divides by 10^log_exponent.
    pub log_exponent: f64,
    /// Minimum gap between incoming expiry and outgoing expiry.
    pub cltv_expiry_delta: u32,
    pub htlc_minimum_msat: u64,
}

impl TrampolineRoutingPolicy {
    /// The fee this node charges for relaying a set totalling
    /// `total_in_msat`. Monotonic non-decreasing in the total.
    pub fn relay_fee_msat(&self, total_in_msat: u64) -> u64 {
        let linear = match total_in_msat.checked_mul(self.fee_proportional_millionths) {
            Some(product) => product / 1_000_000,
            None => return u64::MAX,
        };
        let surcharge = (linear as f64).powf(self.exponent) / 10f64.powf(self.log_exponent);
        self.fee_base_msat.saturating_add(surcharge as u64)
    }

    pub fn fee_sufficient(&self, total_in_msat: u64, forward_msat: u64) -> bool {
        if total_in_msat < forward_msat {
            return false;
        }

        self.relay_fee_msat(total_in_msat) <= total_in_msat - forward_msat
    }
}


#[cfg(test)]
mod encode_failure_tests {
    use super::FailureMessage;

    #[test]
    fn encode_temporary_node_failure() {
        assert_eq!(vec![0x20, 2], FailureMessage::TemporaryNodeFailure.encode());
    }

    #[test]
    fn encode_trampoline_fee_insufficient() {
        assert_eq!(
            vec![0x20, 51],
            FailureMessage::TrampolineFeeInsufficient.encode()
        );
    }

    #[test]
    fn encode_trampoline_expiry_too_soon() {
        assert_eq!(
            vec![0x20, 52],
            FailureMessage::TrampolineExpiryTooSoon.encode()
        );
    }

    #[test]
    fn encode_payment_timeout() {
        assert_eq!(vec![0x00, 23], FailureMessage::PaymentTimeout.encode());
    }

    #[test]
    fn encode_incorrect_or_unknown_payment_details() {
        let failure = FailureMessage::IncorrectOrUnknownPaymentDetails {
            amount_msat: 1,
            height: 2,
        };
        assert_eq!(
            vec![0x40, 15, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2],
            failure.encode()
        );
    }
}

#[cfg(test)]
mod tag_tests {
    use lightning_invoice::PaymentSecret;
    use secp256k1::hashes::{sha256, Hash};

    use super::{FullPaymentTag, PaymentTagKind};

    #[test]
    fn reused_hash_is_distinct_across_kinds() {
        let payment_hash = sha256::Hash::hash(&[7u8; 32]);
        let local = FullPaymentTag {
            payment_hash,
            payment_secret: PaymentSecret([1u8; 32]),
            kind: PaymentTagKind::FinalIncoming,
        };
        let routed = FullPaymentTag {
            kind: PaymentTagKind::TrampolineRouted,
            ..local.clone()
        };

        assert_ne!(local, routed);
    }

    #[test]
    fn reused_hash_is_distinct_across_secrets() {
        let payment_hash = sha256::Hash::hash(&[7u8; 32]);
        let first = FullPaymentTag {
            payment_hash,
            payment_secret: PaymentSecret([1u8; 32]),
            kind: PaymentTagKind::FinalIncoming,
        };
        let second = FullPaymentTag {
            payment_secret: PaymentSecret([2u8; 32]),
            ..first.clone()
        };

        assert_ne!(first, second);
    }
}
