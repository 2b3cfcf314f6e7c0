use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::messages::PaymentEvent;

/// Single-shot, replaceable receive-grace timer. Delivers one
/// [`PaymentEvent::Timeout`] to the owning FSM's input queue unless replaced
/// or cancelled first.
pub struct ReceiveTimeout {
    pending: Option<JoinHandle<()>>,
}

impl ReceiveTimeout {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Schedules a timeout delivery after `grace`, cancelling any previously
    /// pending delivery.
    pub fn replace_work(&mut self, events: mpsc::Sender<PaymentEvent>, grace: Duration) {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(PaymentEvent::Timeout).await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

impl Default for ReceiveTimeout {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReceiveTimeout {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::ReceiveTimeout;
    use crate::messages::PaymentEvent;

    #[tokio::test]
    async fn delivers_a_single_timeout() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut timer = ReceiveTimeout::new();

        timer.replace_work(tx, Duration::from_millis(10));

        assert!(matches!(rx.recv().await, Some(PaymentEvent::Timeout)));
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn replace_work_cancels_the_previous_delivery() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut timer = ReceiveTimeout::new();

        timer.replace_work(tx.clone(), Duration::from_millis(10));
        timer.replace_work(tx, Duration::from_millis(30));

        assert!(matches!(rx.recv().await, Some(PaymentEvent::Timeout)));
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn cancel_drops_the_pending_delivery() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut timer = ReceiveTimeout::new();

        timer.replace_work(tx, Duration::from_millis(10));
        timer.cancel();

        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }
}
