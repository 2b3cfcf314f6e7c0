//! Incoming-payment state machines for a lightning wallet.
//!
//! Two FSM variants decide whether the htlcs of an arriving multipart
//! payment are fulfilled or failed back: a [`LocalReceiver`] for payments
//! terminating at this node and a [`TrampolineRelayer`] for payments routed
//! onward, which also drives the correlated outgoing send. The
//! [`PaymentRegistry`] keeps exactly one FSM per payment tag and fans the
//! wallet's events out to them.
//!
//! [`LocalReceiver`]: local_receiver::LocalReceiver
//! [`TrampolineRelayer`]: trampoline_relayer::TrampolineRelayer
//! [`PaymentRegistry`]: registry::PaymentRegistry

pub mod block_watcher;
pub mod channel_bus;
pub mod local_receiver;
pub mod messages;
pub mod registry;
pub mod sender;
pub mod store;
pub mod timer;
pub mod trampoline_relayer;

pub use messages::{
    ChannelId, FailCommand, FailureMessage, FulfillCommand, FullPaymentTag, InFlightPayments,
    IncomingHtlc, PaymentEvent, PaymentTagKind, RemoteFulfill, TrampolineRoutingPolicy,
};
pub use registry::{PaymentRegistry, ProcessorParams};
