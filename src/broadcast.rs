// Copyright 2023-2024 TradeLayer Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Final submission of signed transactions. Nodes briefly reject a transaction whose inputs they
//! have not seen yet (the commit was relayed a moment ago), only that failure is retried.

use std::time::Duration;

use bitcoin::Txid;
use rand::Rng;
use tracing::debug;

use crate::gateway::{Error, TxGateway};

/// Failure messages meaning the inputs are not visible to the node yet.
const TRANSIENT_PATTERNS: [&str; 3] = [
    "missingorspent",
    "missing inputs",
    "inputs missing or already spent",
];

/// Return true if the node message belongs to the retried failure class.
pub fn is_inputs_missing_or_spent(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|pattern| msg.contains(pattern))
}

/// Bounded retry policy of the broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            min_delay_ms: 800,
            max_delay_ms: 1200,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, drawn uniformly in the configured window.
    pub fn delay(&self) -> Duration {
        let (low, high) = if self.min_delay_ms <= self.max_delay_ms {
            (self.min_delay_ms, self.max_delay_ms)
        } else {
            (self.max_delay_ms, self.min_delay_ms)
        };
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

/// Send the raw transaction, retrying transient rejections up to `policy.max_attempts` times.
/// Any other failure is returned immediately.
pub async fn broadcast_with_retry<G: TxGateway + ?Sized>(
    gateway: &G,
    raw_hex: &str,
    policy: &RetryPolicy,
) -> Result<Txid, Error> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match gateway.send_raw_tx(raw_hex).await {
            Ok(txid) => return Ok(txid),
            Err(Error::Rejected(msg)) if is_inputs_missing_or_spent(&msg) => {
                if attempt >= max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last: msg,
                    });
                }
                let delay = policy.delay();
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %msg,
                    "broadcast rejected, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Quantity;
    use crate::gateway::{Column, SignedPsbt, Signer, TradeTxRequest};
    use crate::role::SwapRole;
    use crate::consensus::CanonicalBytes;
    use crate::transaction::Utxo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Rejects the first `failures` sends with `message`.
    struct FlakyNode {
        failures: u32,
        message: &'static str,
        attempts: AtomicU32,
    }

    impl FlakyNode {
        fn new(failures: u32, message: &'static str) -> Self {
            Self {
                failures,
                message,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TxGateway for FlakyNode {
        async fn build_commit_or_transfer(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &[Utxo],
        ) -> Result<String, Error> {
            unimplemented!()
        }

        async fn build_native_commit(
            &self,
            _: &str,
            _: &str,
            _: bitcoin::Amount,
            _: &[Utxo],
        ) -> Result<String, Error> {
            unimplemented!()
        }

        async fn sign_raw_tx(&self, _: &str, _: &Signer) -> Result<String, Error> {
            unimplemented!()
        }

        async fn send_raw_tx(&self, _: &str) -> Result<Txid, Error> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                Err(Error::Rejected(self.message.to_string()))
            } else {
                Ok(Txid::from_canonical_bytes(&[7; 32]).unwrap())
            }
        }

        async fn build_trade_tx(&self, _: &TradeTxRequest) -> Result<String, Error> {
            unimplemented!()
        }

        async fn sign_psbt(&self, _: &str, _: SwapRole) -> Result<SignedPsbt, Error> {
            unimplemented!()
        }

        async fn get_raw_transaction(&self, _: &Txid) -> Result<String, Error> {
            unimplemented!()
        }

        async fn get_chain_height(&self) -> Result<u32, Error> {
            unimplemented!()
        }

        async fn channel_balance(&self, _: &str, _: u32) -> Result<Quantity, Error> {
            unimplemented!()
        }

        async fn channel_column(&self, _: &str, _: &str) -> Result<Column, Error> {
            unimplemented!()
        }
    }

    #[test]
    fn transient_class() {
        assert!(is_inputs_missing_or_spent("bad-txns-inputs-missingorspent"));
        assert!(is_inputs_missing_or_spent("Missing inputs"));
        assert!(is_inputs_missing_or_spent(
            "Error: inputs missing or already spent"
        ));
        assert!(!is_inputs_missing_or_spent("insufficient fee"));
    }

    #[test]
    fn delay_window() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay();
            assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let node = FlakyNode::new(16, "bad-txns-inputs-missingorspent");
        let res = broadcast_with_retry(&node, "00", &RetryPolicy::default()).await;
        assert!(matches!(
            res,
            Err(Error::RetriesExhausted { attempts: 15, .. })
        ));
        assert_eq!(node.attempts.load(Ordering::SeqCst), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let node = FlakyNode::new(3, "missing inputs");
        let txid = broadcast_with_retry(&node, "00", &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(txid, Txid::from_canonical_bytes(&[7; 32]).unwrap());
        assert_eq!(node.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn other_failures_are_not_retried() {
        let node = FlakyNode::new(16, "insufficient fee");
        let res = broadcast_with_retry(&node, "00", &RetryPolicy::default()).await;
        assert!(matches!(res, Err(Error::Rejected(_))));
        assert_eq!(node.attempts.load(Ordering::SeqCst), 1);
    }
}
