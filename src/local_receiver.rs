use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, trace};

use crate::block_watcher::BlockProvider;
use crate::channel_bus::ChannelBus;
use crate::messages::{
    FailCommand, FailureMessage, FulfillCommand, FullPaymentTag, InFlightPayments, LocalHtlc,
    PaymentEvent, PaymentTagKind,
};
use crate::registry::{FsmMap, ProcessorParams};
use crate::sender::PaymentSender;
use crate::store::{PaymentStatus, PaymentStore};
use crate::timer::ReceiveTimeout;

/// Terminal decision data of a local receive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum LocalData {
    Revealed { preimage: Vec<u8> },
    Aborted { failure: Option<FailureMessage> },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum LocalState {
    /// Collecting parts until the set is covered or the grace period ends.
    Receiving,
    /// Decision pending (`None`, after a timeout) or made and being
    /// re-emitted until the htlcs are gone.
    Finalizing(Option<LocalData>),
    Shutdown,
}

/// Decides whether an incoming multipart payment terminating at this node is
/// fulfilled or failed back.
///
/// Once a preimage has been revealed to any channel the decision is
/// irreversible: every later snapshot that still shows htlcs re-emits
/// fulfills, never fails.
pub struct LocalReceiver<B, C, S, P>
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
    state: LocalState,
}

impl<B, C, S, P> LocalReceiver<B, C, S, P>
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
        debug_assert!(tag.kind == PaymentTagKind::FinalIncoming);
        let mut timeout = ReceiveTimeout::new();
        timeout.replace_work(events_tx.clone(), params.mpp_timeout);
        Self {
            tag,
            params,
            registrations,
            events_tx,
            timeout,
            state: LocalState::Receiving,
        }
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(payment_hash = %self.tag.payment_hash))]
    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<PaymentEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                // The state is left untouched, the next snapshot retries.
                error!("failed to handle payment event: {:?}", e);
            }
            if self.state == LocalState::Shutdown {
                break;
            }
        }
    }

    async fn handle(&mut self, event: PaymentEvent) -> Result<()> {
        match event {
            PaymentEvent::Snapshot(in_flight) => self.on_snapshot(&in_flight).await,
            PaymentEvent::HtlcArrived => {
                if self.state == LocalState::Receiving {
                    self.timeout
                        .replace_work(self.events_tx.clone(), self.params.mpp_timeout);
                }
                Ok(())
            }
            PaymentEvent::Timeout => {
                if self.state == LocalState::Receiving {
                    debug!("collection grace period expired");
                    self.state = LocalState::Finalizing(None);
                    self.notify_update().await;
                }
                Ok(())
            }
            // Outgoing-send events only concern relayed payments.
            PaymentEvent::SenderFailed(_) | PaymentEvent::RemoteFulfill(_) => Ok(()),
        }
    }

    async fn on_snapshot(&mut self, in_flight: &InFlightPayments) -> Result<()> {
        if !in_flight.contains(&self.tag) {
            return self.shutdown().await;
        }

        let adds = in_flight.local_for(&self.tag);
        match self.state.clone() {
            LocalState::Receiving => self.resolve(&adds).await,
            LocalState::Finalizing(None) => self.finalize(&adds).await,
            LocalState::Finalizing(Some(LocalData::Revealed { preimage })) => {
                self.fulfill_all(&adds, &preimage).await;
                Ok(())
            }
            LocalState::Finalizing(Some(LocalData::Aborted { failure })) => {
                self.fail_all(&adds, failure.as_ref()).await;
                Ok(())
            }
            LocalState::Shutdown => Ok(()),
        }
    }

    /// Attempts a decision while parts are still allowed to arrive.
    async fn resolve(&mut self, adds: &[LocalHtlc]) -> Result<()> {
        let payment_hash = self.tag.payment_hash;
        let preimage = self.params.store.get_preimage(&payment_hash).await?;
        let info = self.params.store.get_payment_info(&payment_hash).await?;
        let current_height = self.params.block_provider.current_height().await;
        let received_msat: u64 = adds.iter().map(|add| add.amount_msat).sum();

        let info = match info {
            Some(info) => info,
            None => {
                // No invoice: claim if we happen to know the preimage,
                // otherwise reject without leaking anything.
                return match preimage {
                    Some(preimage) => self.become_revealed(preimage, adds).await,
                    None => self.become_aborted(None, adds).await,
                };
            }
        };

        if info.is_incoming && info.status == PaymentStatus::Succeeded {
            return self.become_revealed(info.preimage, adds).await;
        }

        if adds.iter().any(|add| {
            add.cltv_expiry < current_height + self.params.cltv_reject_threshold
        }) {
            debug!("htlc expires too close to the chain tip");
            return self.become_aborted(None, adds).await;
        }

        match info.amount_msat {
            Some(amount_msat) if info.is_incoming && received_msat >= amount_msat => {
                self.become_revealed(info.preimage, adds).await
            }
            _ => {
                trace!(received_msat, "waiting for more parts");
                Ok(())
            }
        }
    }

    /// Last-chance decision after the grace period: reveal if anything allows
    /// it, otherwise fail the whole set back.
    async fn finalize(&mut self, adds: &[LocalHtlc]) -> Result<()> {
        let payment_hash = self.tag.payment_hash;
        let info = self.params.store.get_payment_info(&payment_hash).await?;
        let received_msat: u64 = adds.iter().map(|add| add.amount_msat).sum();

        if let Some(info) = info.filter(|info| info.is_incoming) {
            if info.status == PaymentStatus::Succeeded {
                return self.become_revealed(info.preimage, adds).await;
            }
            match info.amount_msat {
                Some(amount_msat) => {
                    if received_msat >= amount_msat {
                        return self.become_revealed(info.preimage, adds).await;
                    }
                }
                None => {
                    // Amount-less invoice: the first htlc advertises the
                    // total the sender intended.
                    if adds
                        .first()
                        .map_or(false, |first| received_msat >= first.total_msat)
                    {
                        return self.become_revealed(info.preimage, adds).await;
                    }
                }
            }
        }

        if let Some(preimage) = self.params.store.get_preimage(&payment_hash).await? {
            return self.become_revealed(preimage, adds).await;
        }

        self.become_aborted(Some(FailureMessage::PaymentTimeout), adds)
            .await
    }

    async fn become_revealed(&mut self, preimage: Vec<u8>, adds: &[LocalHtlc]) -> Result<()> {
        let payment_hash = self.tag.payment_hash;
        let received_msat: u64 = adds.iter().map(|add| add.amount_msat).sum();

        // The preimage must be durable before any fulfill goes out; an error
        // here leaves the state untouched so the next snapshot retries.
        self.params
            .store
            .update_incoming_succeeded(&payment_hash, received_msat)
            .await?;
        self.params
            .store
            .store_preimage(&payment_hash, preimage.clone())
            .await?;
        self.params.store.invalidate(&payment_hash).await;

        debug!(received_msat, "payment resolved, revealing preimage");
        self.state = LocalState::Finalizing(Some(LocalData::Revealed {
            preimage: preimage.clone(),
        }));
        self.fulfill_all(adds, &preimage).await;
        Ok(())
    }

    async fn become_aborted(
        &mut self,
        failure: Option<FailureMessage>,
        adds: &[LocalHtlc],
    ) -> Result<()> {
        debug!(failure = ?failure, "payment aborted");
        self.state = LocalState::Finalizing(Some(LocalData::Aborted {
            failure: failure.clone(),
        }));
        self.fail_all(adds, failure.as_ref()).await;
        Ok(())
    }

    async fn fulfill_all(&self, adds: &[LocalHtlc], preimage: &[u8]) {
        for add in adds {
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

    async fn fail_all(&self, adds: &[LocalHtlc], failure: Option<&FailureMessage>) {
        let current_height = self.params.block_provider.current_height().await;
        for add in adds {
            let cmd = match failure {
                Some(failure) => FailCommand {
                    channel_id: add.channel_id,
                    htlc_id: add.htlc_id,
                    failure: failure.clone(),
                },
                None => FailCommand::incorrect_details(
                    add.channel_id,
                    add.htlc_id,
                    add.amount_msat,
                    current_height,
                ),
            };
            self.params.channel_bus.fail(cmd).await;
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        trace!("no htlcs left for this tag, shutting down");
        self.timeout.cancel();
        self.registrations.lock().await.remove(&self.tag);
        self.state = LocalState::Shutdown;
        Ok(())
    }

    async fn notify_update(&self) {
        let _ = self.params.updates.send(self.tag.clone()).await;
    }
}
