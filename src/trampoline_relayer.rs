use std::sync::Arc;

use anyhow::Result;
use secp256k1::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, error, field, instrument, trace};

use crate::block_watcher::BlockProvider;
use crate::channel_bus::ChannelBus;
use crate::messages::{
    FailCommand, FailureMessage, FulfillCommand, FullPaymentTag, InFlightPayments,
    OutgoingAttempt, PaymentEvent, PaymentTagKind, RemoteFulfill, TrampolineHtlc,
};
use crate::registry::{FsmMap, ProcessorParams};
use crate::sender::{
    random_payment_secret, LocalSendFailure, OutgoingPaymentSenderData, PaymentSender, RelayMode,
    SendFailure, SendMultiPart,
};
use crate::store::{PaymentStore, RelayedPreimage};
use crate::timer::ReceiveTimeout;

/// Where the outgoing side of a relay currently stands.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SendingData {
    /// A multipart send toward `final_node` is in flight.
    Processing { final_node: PublicKey },
    /// Leftover outgoing parts must settle before anything else happens.
    /// `retry` distinguishes restart recovery (incoming still covers the
    /// relay, try again) from a set we can only abort.
    Stopping { retry: bool },
    /// The downstream peer revealed the preimage, claim upstream on the next
    /// snapshot.
    Revealed { preimage: Vec<u8> },
}

/// Terminal decision data of a relay.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RelayData {
    Revealed { preimage: Vec<u8> },
    Aborted { failure: FailureMessage },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RelayState {
    Receiving,
    Sending(SendingData),
    Finalizing(RelayData),
    Shutdown,
}

/// Decides whether an incoming multipart payment routed through this node is
/// fulfilled or failed back, dispatching and tracking the correlated
/// outgoing send.
///
/// The upstream set is never aborted while outgoing parts are in flight:
/// either the downstream preimage arrives, or every outgoing part fails
/// first.
pub struct TrampolineRelayer<B, C, S, P>
where
    B: BlockProvider,
    C: ChannelBus,
    S: PaymentStore,
    P: PaymentSender,
{
    tag: FullPaymentTag,
    params: Arc<ProcessorParams<B, C, S, P>>,
    registrations: FsmMap,
    events_tx: mpsc::Sender<PaymentEvent>,
    timeout: ReceiveTimeout,
    state: RelayState,
}

impl<B, C, S, P> TrampolineRelayer<B, C, S, P>
where
    B: BlockProvider + Send + Sync + 'static,
    C: ChannelBus + Send + Sync + 'static,
    S: PaymentStore + Send + Sync + 'static,
    P: PaymentSender + Send + Sync + 'static,
{
    pub(crate) fn new(
        tag: FullPaymentTag,
        params: Arc<ProcessorParams<B, C, S, P>>,
        registrations: FsmMap,
        events_tx: mpsc::Sender<PaymentEvent>,
    ) -> Self {
        debug_assert!(tag.kind == PaymentTagKind::TrampolineRouted);
        let mut timeout = ReceiveTimeout::new();
        timeout.replace_work(events_tx.clone(), params.mpp_timeout);
        Self {
            tag,
            params,
            registrations,
            events_tx,
            timeout,
            state: RelayState::Receiving,
        }
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(payment_hash = %self.tag.payment_hash))]
    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<PaymentEvent>) {
        self.params.sender.create_sender(self.tag.clone()).await;

        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                // The state is left untouched, the next snapshot retries.
                error!("failed to handle payment event: {:?}", e);
            }
            if self.state == RelayState::Shutdown {
                break;
            }
        }
    }

    async fn handle(&mut self, event: PaymentEvent) -> Result<()> {
        match event {
            PaymentEvent::Snapshot(in_flight) => self.on_snapshot(&in_flight).await,
            PaymentEvent::HtlcArrived => {
                if self.state == RelayState::Receiving {
                    self.timeout
                        .replace_work(self.events_tx.clone(), self.params.mpp_timeout);
                }
                Ok(())
            }
            PaymentEvent::Timeout => {
                if self.state == RelayState::Receiving {
                    debug!("collection grace period expired");
                    self.state = RelayState::Finalizing(RelayData::Aborted {
                        failure: FailureMessage::PaymentTimeout,
                    });
                    self.notify_update().await;
                }
                Ok(())
            }
            PaymentEvent::RemoteFulfill(fulfill) => {
                self.on_remote_fulfill(fulfill).await;
                Ok(())
            }
            PaymentEvent::SenderFailed(data) => self.on_sender_failed(data).await,
        }
    }

    async fn on_snapshot(&mut self, in_flight: &InFlightPayments) -> Result<()> {
        let ins = in_flight.trampoline_for(&self.tag);
        let outs = in_flight.outgoing_for(&self.tag);
        if ins.is_empty() && outs.is_empty() {
            return self.shutdown().await;
        }

        match self.state.clone() {
            RelayState::Receiving => self.resolve(&ins, &outs).await,
            RelayState::Sending(SendingData::Revealed { preimage }) => {
                self.become_revealed(preimage, &ins).await
            }
            RelayState::Finalizing(RelayData::Revealed { preimage }) => {
                self.fulfill_all(&ins, &preimage).await;
                Ok(())
            }
            RelayState::Finalizing(RelayData::Aborted { failure }) => {
                self.fail_all(&ins, &failure).await;
                Ok(())
            }
            RelayState::Sending(_) | RelayState::Shutdown => Ok(()),
        }
    }

    /// Attempts a decision while parts are still allowed to arrive.
    async fn resolve(&mut self, ins: &[TrampolineHtlc], outs: &[OutgoingAttempt]) -> Result<()> {
        if let Some(preimage) = self
            .params
            .store
            .get_preimage(&self.tag.payment_hash)
            .await?
        {
            return self.become_revealed(preimage, ins).await;
        }

        if relay_covered(ins) {
            if outs.is_empty() {
                return self.become_sending_or_aborted(ins).await;
            }

            // Outgoing parts survived a restart. Let them settle, then retry
            // the whole relay from scratch.
            debug!("covered set with leftover outgoing parts, stopping for retry");
            self.state = RelayState::Sending(SendingData::Stopping { retry: true });
            return Ok(());
        }

        if !outs.is_empty() {
            // Outgoing parts exist but incoming no longer covers the relay.
            // Wait for the outgoing side to settle, then abort upstream.
            debug!("uncovered set with outgoing parts, stopping");
            self.state = RelayState::Sending(SendingData::Stopping { retry: false });
            return Ok(());
        }

        trace!("waiting for more parts");
        Ok(())
    }

    async fn on_remote_fulfill(&mut self, fulfill: RemoteFulfill) {
        if fulfill.payment_hash != self.tag.payment_hash {
            return;
        }

        // Ignored once the decision is terminal.
        if matches!(
            self.state,
            RelayState::Receiving | RelayState::Sending(_)
        ) {
            debug!("downstream peer revealed the preimage");
            self.state = RelayState::Sending(SendingData::Revealed {
                preimage: fulfill.preimage,
            });
            self.notify_update().await;
        }
    }

    async fn on_sender_failed(&mut self, data: OutgoingPaymentSenderData) -> Result<()> {
        if data.tag != self.tag {
            return Ok(());
        }

        match self.state.clone() {
            RelayState::Sending(SendingData::Stopping { retry: true }) => {
                debug!("leftover outgoing parts settled, retrying");
                self.state = RelayState::Receiving;
                self.timeout
                    .replace_work(self.events_tx.clone(), self.params.mpp_timeout);
                self.notify_update().await;
                Ok(())
            }
            RelayState::Sending(SendingData::Stopping { retry: false }) => {
                self.abort_with_failures(&data.failures, &invalid_pub_key())
                    .await
            }
            RelayState::Sending(SendingData::Processing { final_node }) => {
                self.abort_with_failures(&data.failures, &final_node).await
            }
            _ => Ok(()),
        }
    }

    /// Validates a covered set, first failing rule wins.
    fn validate(
        &self,
        first: &TrampolineHtlc,
        ins: &[TrampolineHtlc],
        current_height: u32,
    ) -> Option<FailureMessage> {
        let forward = &first.forward;

        // An MPP-incapable non-trampoline recipient: we refuse to relay.
        if forward.invoice_features.is_some() && forward.payment_secret.is_none() {
            return Some(FailureMessage::TemporaryNodeFailure);
        }

        let total_in_msat = total_in(ins);
        if !self
            .params
            .routing_policy
            .fee_sufficient(total_in_msat, forward.amount_to_forward_msat)
        {
            return Some(FailureMessage::TrampolineFeeInsufficient);
        }

        let incorrect_details = FailureMessage::IncorrectOrUnknownPaymentDetails {
            amount_msat: first.amount_msat,
            height: current_height,
        };
        if ins
            .iter()
            .any(|add| add.forward.amount_to_forward_msat != forward.amount_to_forward_msat)
        {
            return Some(incorrect_details.clone());
        }
        if ins
            .iter()
            .any(|add| add.outer_total_msat != first.outer_total_msat)
        {
            return Some(incorrect_details);
        }

        if min_expiry(ins).saturating_sub(forward.outgoing_cltv)
            < self.params.routing_policy.cltv_expiry_delta
        {
            return Some(FailureMessage::TrampolineExpiryTooSoon);
        }
        if forward.outgoing_cltv <= current_height {
            return Some(FailureMessage::TrampolineExpiryTooSoon);
        }

        if forward.amount_to_forward_msat < self.params.routing_policy.htlc_minimum_msat {
            return Some(FailureMessage::TemporaryNodeFailure);
        }

        None
    }

    async fn become_sending_or_aborted(&mut self, ins: &[TrampolineHtlc]) -> Result<()> {
        let first = match ins.first() {
            Some(first) => first.clone(),
            None => return Ok(()),
        };

        let current_height = self.params.block_provider.current_height().await;
        if let Some(failure) = self.validate(&first, ins, current_height) {
            debug!(failure = field::debug(&failure), "relay validation failed");
            return self.become_aborted(failure, ins).await;
        }

        let forward = first.forward;
        let total_in_msat = total_in(ins);
        let fee_reserve_msat = total_in_msat
            .saturating_sub(forward.amount_to_forward_msat)
            .saturating_sub(self.params.routing_policy.relay_fee_msat(total_in_msat));
        let max_cltv_delta = min_expiry(ins)
            .saturating_sub(forward.outgoing_cltv)
            .saturating_sub(self.params.routing_policy.cltv_expiry_delta);
        let allowed_channels = self.params.channel_bus.usable_channels().await;

        let (payment_secret, mode) = match (&forward.invoice_features, &forward.payment_secret) {
            // The recipient is a plain MPP-capable node: address it with the
            // invoice secret and routing hints.
            (Some(_), Some(payment_secret)) => (
                payment_secret.clone(),
                RelayMode::Mpp {
                    assisted_edges: forward.routing_hints.clone(),
                },
            ),
            // The recipient is another trampoline: forward the inner onion
            // under a fresh outer secret.
            _ => (
                random_payment_secret(),
                RelayMode::Trampoline {
                    next_onion: first.next_onion.clone(),
                },
            ),
        };

        let request = SendMultiPart {
            tag: self.tag.clone(),
            max_cltv_delta,
            destination: forward.outgoing_node_id,
            onion_total_msat: forward.amount_to_forward_msat,
            actual_total_msat: forward.amount_to_forward_msat,
            fee_reserve_msat,
            outgoing_cltv: forward.outgoing_cltv,
            allowed_channels,
            payment_secret,
            mode,
        };

        debug!(
            fee_reserve_msat,
            max_cltv_delta, "relay validated, dispatching outgoing payment"
        );
        self.state = RelayState::Sending(SendingData::Processing {
            final_node: forward.outgoing_node_id,
        });
        self.params.sender.send_multipart(request).await;
        Ok(())
    }

    async fn abort_with_failures(
        &mut self,
        failures: &[SendFailure],
        final_node: &PublicKey,
    ) -> Result<()> {
        let failure = select_upstream_failure(failures, final_node);
        debug!(
            failure = field::debug(&failure),
            "outgoing payment fully failed, aborting upstream"
        );
        self.state = RelayState::Finalizing(RelayData::Aborted { failure });
        self.notify_update().await;
        Ok(())
    }

    async fn become_revealed(&mut self, preimage: Vec<u8>, ins: &[TrampolineHtlc]) -> Result<()> {
        let payment_hash = self.tag.payment_hash;
        let used_fee_msat = self.params.sender.used_fee_msat(&self.tag).await;
        // `ins` may be empty in pathological recovery, the record then
        // carries zeroes.
        let (amount_forwarded_msat, final_fee_msat) = match ins.first() {
            Some(first) => (
                first.forward.amount_to_forward_msat,
                first
                    .outer_total_msat
                    .saturating_sub(first.forward.amount_to_forward_msat)
                    .saturating_sub(used_fee_msat),
            ),
            None => (0, 0),
        };

        // The preimage must be durable before any fulfill goes out; an error
        // here leaves the state untouched so the next snapshot retries.
        self.params
            .store
            .store_preimage(&payment_hash, preimage.clone())
            .await?;
        self.params
            .store
            .add_relayed_preimage_info(
                &payment_hash,
                RelayedPreimage {
                    preimage: preimage.clone(),
                    amount_forwarded_msat,
                    final_fee_msat,
                },
            )
            .await?;
        self.params.store.invalidate(&payment_hash).await;

        debug!(final_fee_msat, "relay resolved, revealing preimage upstream");
        self.state = RelayState::Finalizing(RelayData::Revealed {
            preimage: preimage.clone(),
        });
        self.fulfill_all(ins, &preimage).await;
        Ok(())
    }

    async fn become_aborted(
        &mut self,
        failure: FailureMessage,
        ins: &[TrampolineHtlc],
    ) -> Result<()> {
        self.state = RelayState::Finalizing(RelayData::Aborted {
            failure: failure.clone(),
        });
        self.fail_all(ins, &failure).await;
        Ok(())
    }

    async fn fulfill_all(&self, ins: &[TrampolineHtlc], preimage: &[u8]) {
        for add in ins {
            self.params
                .channel_bus
                .fulfill(FulfillCommand {
                    channel_id: add.channel_id,
                    htlc_id: add.htlc_id,
                    preimage: preimage.to_vec(),
                })
                .await;
        }
    }

    async fn fail_all(&self, ins: &[TrampolineHtlc], failure: &FailureMessage) {
        for add in ins {
            self.params
                .channel_bus
                .fail(FailCommand {
                    channel_id: add.channel_id,
                    htlc_id: add.htlc_id,
                    failure: failure.clone(),
                })
                .await;
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        trace!("no htlcs or outgoing parts left for this tag, shutting down");
        self.timeout.cancel();
        self.params.sender.remove_sender(&self.tag).await;
        self.registrations.lock().await.remove(&self.tag);
        self.state = RelayState::Shutdown;
        Ok(())
    }

    async fn notify_update(&self) {
        let _ = self.params.updates.send(self.tag.clone()).await;
    }
}

fn total_in(ins: &[TrampolineHtlc]) -> u64 {
    ins.iter().map(|add| add.amount_msat).sum()
}

fn min_expiry(ins: &[TrampolineHtlc]) -> u32 {
    ins.iter().map(|add| add.cltv_expiry).min().unwrap_or(0)
}

/// Whether the incoming set adds up to the total advertised in the outer
/// payload.
fn relay_covered(ins: &[TrampolineHtlc]) -> bool {
    ins.first()
        .map_or(false, |first| total_in(ins) >= first.outer_total_msat)
}

/// Reduces the failures of a fully-failed outgoing payment to the single
/// message reported upstream. Total: always yields a message.
pub(crate) fn select_upstream_failure(
    failures: &[SendFailure],
    final_node: &PublicKey,
) -> FailureMessage {
    for failure in failures {
        if let SendFailure::Remote {
            origin_node,
            message,
        } = failure
        {
            if origin_node == final_node {
                return message.clone();
            }
        }
    }

    // A local routing dead end means our fee reserve was the limiting
    // factor.
    if failures.iter().any(|failure| {
        matches!(
            failure,
            SendFailure::Local {
                reason: LocalSendFailure::NoRoutesFound
            }
        )
    }) {
        return FailureMessage::TrampolineFeeInsufficient;
    }

    for failure in failures {
        if let SendFailure::Remote { message, .. } = failure {
            return message.clone();
        }
    }

    FailureMessage::TemporaryNodeFailure
}

/// Sentinel node id used when aborting out of a stopped send. It never
/// matches a failure origin, so the final-node preference cannot fire there.
pub(crate) fn invalid_pub_key() -> PublicKey {
    let bytes = hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
        .expect("static key bytes");
    PublicKey::from_slice(&bytes).expect("static key")
}
