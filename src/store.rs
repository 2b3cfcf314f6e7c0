use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use secp256k1::hashes::sha256;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;

#[cfg(test)]
use mockall::automock;

/// Status of a payment row known to the wallet database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Aborted,
}

/// Invoice metadata for a known payment hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub is_incoming: bool,
    /// None means an amount-less invoice.
    pub amount_msat: Option<u64>,
    #[serde(with = "hex::serde")]
    pub preimage: Vec<u8>,
    pub status: PaymentStatus,
}

/// Record of a preimage obtained by relaying a payment through this node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayedPreimage {
    #[serde(with = "hex::serde")]
    pub preimage: Vec<u8>,
    pub amount_forwarded_msat: u64,
    pub final_fee_msat: u64,
}

/// Preimage and invoice store backing the payment FSMs. Writes must be
/// durable before they return: a fulfill command is only ever emitted after
/// `store_preimage` has completed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymentStore {
    async fn get_payment_info(&self, payment_hash: &sha256::Hash) -> Result<Option<PaymentInfo>>;
    async fn get_preimage(&self, payment_hash: &sha256::Hash) -> Result<Option<Vec<u8>>>;
    async fn update_incoming_succeeded(
        &self,
        payment_hash: &sha256::Hash,
        amount_msat: u64,
    ) -> Result<()>;
    async fn store_preimage(&self, payment_hash: &sha256::Hash, preimage: Vec<u8>) -> Result<()>;
    async fn add_relayed_preimage_info(
        &self,
        payment_hash: &sha256::Hash,
        info: RelayedPreimage,
    ) -> Result<()>;
    /// Drops any cached lookups for the hash so subsequent reads observe
    /// persistence.
    async fn invalidate(&self, payment_hash: &sha256::Hash);
}

/// Memoizing wrapper around a payment store. Lookups hit the inner store once
/// per hash until `invalidate` is called for it.
pub struct CachedStore<S> {
    inner: S,
    info_cache: Mutex<HashMap<sha256::Hash, Option<PaymentInfo>>>,
    preimage_cache: Mutex<HashMap<sha256::Hash, Option<Vec<u8>>>>,
}

impl<S> CachedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            info_cache: Mutex::new(HashMap::new()),
            preimage_cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S> PaymentStore for CachedStore<S>
where
    S: PaymentStore + Send + Sync,
{
    #[instrument(level = "trace", skip(self))]
    async fn get_payment_info(&self, payment_hash: &sha256::Hash) -> Result<Option<PaymentInfo>> {
        let mut cache = self.info_cache.lock().await;
        if let Some(info) = cache.get(payment_hash) {
            return Ok(info.clone());
        }

        let info = self.inner.get_payment_info(payment_hash).await?;
        cache.insert(*payment_hash, info.clone());
        Ok(info)
    }

    #[instrument(level = "trace", skip(self))]
    async fn get_preimage(&self, payment_hash: &sha256::Hash) -> Result<Option<Vec<u8>>> {
        let mut cache = self.preimage_cache.lock().await;
        if let Some(preimage) = cache.get(payment_hash) {
            return Ok(preimage.clone());
        }

        let preimage = self.inner.get_preimage(payment_hash).await?;
        cache.insert(*payment_hash, preimage.clone());
        Ok(preimage)
    }

    async fn update_incoming_succeeded(
        &self,
        payment_hash: &sha256::Hash,
        amount_msat: u64,
    ) -> Result<()> {
        self.inner
            .update_incoming_succeeded(payment_hash, amount_msat)
            .await
    }

    async fn store_preimage(&self, payment_hash: &sha256::Hash, preimage: Vec<u8>) -> Result<()> {
        self.inner.store_preimage(payment_hash, preimage).await
    }

    async fn add_relayed_preimage_info(
        &self,
        payment_hash: &sha256::Hash,
        info: RelayedPreimage,
    ) -> Result<()> {
        self.inner
            .add_relayed_preimage_info(payment_hash, info)
            .await
    }

    async fn invalidate(&self, payment_hash: &sha256::Hash) {
        self.info_cache.lock().await.remove(payment_hash);
        self.preimage_cache.lock().await.remove(payment_hash);
        self.inner.invalidate(payment_hash).await;
    }
}


#[cfg(test)]
mod serialize_record_tests {
    use super::{PaymentInfo, PaymentStatus, RelayedPreimage};

    #[test]
    fn serialize_payment_info() {
        let info = PaymentInfo {
            is_incoming: true,
            amount_msat: Some(1000),
            preimage: vec![1],
            status: PaymentStatus::Pending,
        };
        let j = serde_json::to_string(&info).unwrap();
        assert_eq!(
            r#"{"is_incoming":true,"amount_msat":1000,"preimage":"01","status":"Pending"}"#,
            j
        );
    }

    #[test]
    fn deserialize_relayed_preimage() {
        let raw = r#"{"preimage":"02","amount_forwarded_msat":95000,"final_fee_msat":4700}"#;
        let info: RelayedPreimage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            RelayedPreimage {
                preimage: vec![2],
                amount_forwarded_msat: 95000,
                final_fee_msat: 4700,
            },
            info
        );
    }
}
