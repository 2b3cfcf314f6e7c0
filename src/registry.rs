use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, trace};

use crate::block_watcher::BlockProvider;
use crate::channel_bus::ChannelBus;
use crate::local_receiver::LocalReceiver;
use crate::messages::{
    FullPaymentTag, InFlightPayments, IncomingHtlc, PaymentEvent, PaymentTagKind, RemoteFulfill,
    TrampolineRoutingPolicy,
};
use crate::sender::{OutgoingPaymentSenderData, PaymentSender};
use crate::store::PaymentStore;
use crate::trampoline_relayer::TrampolineRelayer;

const EVENT_QUEUE_DEPTH: usize = 16;

/// Constructor parameters shared by every payment FSM.
pub struct ProcessorParams<B, C, S, P>
where
    B: BlockProvider,
    C: ChannelBus,
    S: PaymentStore,
    P: PaymentSender,
{
    /// Provides the current chain tip.
    pub block_provider: Arc<B>,

    /// Routes fulfill and fail commands back to channels.
    pub channel_bus: Arc<C>,

    /// Preimage and invoice lookups, and the settlement records.
    pub store: Arc<S>,

    /// Dispatches correlated outgoing multipart payments.
    pub sender: Arc<P>,

    /// Fee and expiry policy enforced on relayed payments.
    pub routing_policy: TrampolineRoutingPolicy,

    /// Timeout before multipart sets that don't add up to the expected
    /// amount are failed back.
    pub mpp_timeout: Duration,

    /// Blocks-to-expiry below which a terminal incoming htlc is rejected.
    pub cltv_reject_threshold: u32,

    /// FSMs announce state changes here; the wallet responds by publishing a
    /// fresh in-flight snapshot.
    pub updates: mpsc::Sender<FullPaymentTag>,
}

pub(crate) struct FsmHandle {
    pub(crate) events_tx: mpsc::Sender<PaymentEvent>,
}

pub(crate) type FsmMap = Arc<Mutex<HashMap<FullPaymentTag, FsmHandle>>>;

/// Maps payment tags to their active FSM. Creates FSMs on first htlc arrival
/// and fans wallet events out to them; an entry is removed only by its FSM
/// upon shutdown.
pub struct PaymentRegistry<B, C, S, P>
where
    B: BlockProvider,
    C: ChannelBus,
    S: PaymentStore,
    P: PaymentSender,
{
    params: Arc<ProcessorParams<B, C, S, P>>,
    fsms: FsmMap,
}

impl<B, C, S, P> PaymentRegistry<B, C, S, P>
where
    B: BlockProvider + Send + Sync + 'static,
    C: ChannelBus + Send + Sync + 'static,
    S: PaymentStore + Send + Sync + 'static,
    P: PaymentSender + Send + Sync + 'static,
{
    pub fn new(params: ProcessorParams<B, C, S, P>) -> Self {
        Self {
            params: Arc::new(params),
            fsms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Delivers one decoded htlc arrival, creating the FSM for its tag if
    /// this is the first part.
    #[instrument(
        level = "debug",
        skip_all,
        fields(payment_hash = %htlc.full_tag().payment_hash))]
    pub async fn htlc_arrived(&self, htlc: &IncomingHtlc) {
        let tag = htlc.full_tag();
        let events_tx = {
            let mut fsms = self.fsms.lock().await;
            match fsms.get(&tag) {
                Some(handle) => handle.events_tx.clone(),
                None => {
                    let events_tx = self.spawn_fsm(&mut fsms, tag.clone());
                    debug!("created payment fsm");
                    events_tx
                }
            }
        };

        // The map lock is released before enqueueing: the FSM may be taking
        // it to deregister itself.
        let _ = events_tx.send(PaymentEvent::HtlcArrived).await;
    }

    /// Fans the wallet's periodic snapshot out to every active FSM.
    pub async fn snapshot(&self, in_flight: InFlightPayments) {
        let in_flight = Arc::new(in_flight);
        let handles: Vec<_> = {
            let fsms = self.fsms.lock().await;
            fsms.values().map(|handle| handle.events_tx.clone()).collect()
        };

        trace!(fsms = handles.len(), "dispatching snapshot");
        for events_tx in handles {
            let _ = events_tx
                .send(PaymentEvent::Snapshot(Arc::clone(&in_flight)))
                .await;
        }
    }

    /// Routes a terminal outgoing-send outcome to the FSM owning its tag.
    pub async fn sender_failed(&self, data: OutgoingPaymentSenderData) {
        let events_tx = {
            let fsms = self.fsms.lock().await;
            fsms.get(&data.tag).map(|handle| handle.events_tx.clone())
        };

        if let Some(events_tx) = events_tx {
            let _ = events_tx.send(PaymentEvent::SenderFailed(data)).await;
        }
    }

    /// Routes a downstream fulfill to every trampoline FSM relaying the
    /// fulfilled hash.
    pub async fn remote_fulfill(&self, fulfill: RemoteFulfill) {
        let handles: Vec<_> = {
            let fsms = self.fsms.lock().await;
            fsms.iter()
                .filter(|(tag, _)| {
                    tag.kind == PaymentTagKind::TrampolineRouted
                        && tag.payment_hash == fulfill.payment_hash
                })
                .map(|(_, handle)| handle.events_tx.clone())
                .collect()
        };

        for events_tx in handles {
            let _ = events_tx
                .send(PaymentEvent::RemoteFulfill(fulfill.clone()))
                .await;
        }
    }

    /// Tags with an active FSM.
    pub async fn active_tags(&self) -> Vec<FullPaymentTag> {
        self.fsms.lock().await.keys().cloned().collect()
    }

    fn spawn_fsm(
        &self,
        fsms: &mut HashMap<FullPaymentTag, FsmHandle>,
        tag: FullPaymentTag,
    ) -> mpsc::Sender<PaymentEvent> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        match tag.kind {
            PaymentTagKind::FinalIncoming => {
                let fsm = LocalReceiver::new(
                    tag.clone(),
                    Arc::clone(&self.params),
                    Arc::clone(&self.fsms),
                    events_tx.clone(),
                );
                tokio::spawn(fsm.run(events_rx));
            }
            PaymentTagKind::TrampolineRouted => {
                let fsm = TrampolineRelayer::new(
                    tag.clone(),
                    Arc::clone(&self.params),
                    Arc::clone(&self.fsms),
                    events_tx.clone(),
                );
                tokio::spawn(fsm.run(events_rx));
            }
        }

        fsms.insert(
            tag,
            FsmHandle {
                events_tx: events_tx.clone(),
            },
        );
        events_tx
    }
}
