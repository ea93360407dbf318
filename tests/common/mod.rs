#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::blockdata::witness::Witness;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::util::psbt::PartiallySignedTransaction;
use bitcoin::{PublicKey, Txid};

use tradelayer_swap::amount::Quantity;
use tradelayer_swap::blockchain::Network;
use tradelayer_swap::channel::{self, MessageChannel};
use tradelayer_swap::config::SwapConfig;
use tradelayer_swap::escrow;
use tradelayer_swap::gateway::{
    Column, Error, MultisigInfo, SignedPsbt, Signer, TradeTxRequest, TxGateway, Wallet,
};
use tradelayer_swap::protocol::{StepTag, SwapEvent};
use tradelayer_swap::role::SwapRole;
use tradelayer_swap::swap::SwapContext;
use tradelayer_swap::trade::{
    FuturesProps, Party, SpotProps, TradeId, TradeIntent, TradeKind, TradeProps,
};
use tradelayer_swap::transaction::{self, Utxo};

pub const BUYER_KEY: &str = "02c66e7d8966b5c555af5805989da9fbf8db95e15631ce358c3a1710c962679063";
pub const SELLER_KEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

pub const BUYER_SOCKET: &str = "buyer-socket";
pub const SELLER_SOCKET: &str = "seller-socket";

const WALLET_SATS: u64 = 1_000_000_000;
const ESCROW_SATS: u64 = 1_000;
const CHAIN_HEIGHT: u32 = 2_000;
const FINAL: u32 = 0xFFFF_FFFF;
const REPLACEABLE: u32 = 0xFFFF_FFFD;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn buyer() -> Party {
    Party::new(
        "tltc1qbuyer",
        PublicKey::from_str(BUYER_KEY).unwrap(),
        BUYER_SOCKET,
    )
}

pub fn seller() -> Party {
    Party::new(
        "tltc1qseller",
        PublicKey::from_str(SELLER_KEY).unwrap(),
        SELLER_SOCKET,
    )
}

/// Seller sells 5 of property 7 for 2 units of the native coin.
pub fn utxo_trade() -> TradeIntent {
    spot_trade(7, 0)
}

/// Seller sells 5 units of the native coin for 2 of property 3.
pub fn native_sale_trade() -> TradeIntent {
    spot_trade(0, 3)
}

/// Seller sells 5 of property 7 for 2 of property 3, both legs go through the channel.
pub fn channel_trade() -> TradeIntent {
    spot_trade(7, 3)
}

pub fn spot_trade(prop_id_for_sale: u32, prop_id_desired: u32) -> TradeIntent {
    TradeIntent::new(
        TradeId::random(),
        TradeKind::Spot,
        buyer(),
        seller(),
        TradeProps::Spot(SpotProps {
            prop_id_for_sale,
            prop_id_desired,
            amount_for_sale: Quantity::from_units(5).unwrap(),
            amount_desired: Quantity::from_units(2).unwrap(),
            transfer_flag: false,
        }),
    )
    .unwrap()
}

/// Channel trade where both parties move their legs from existing channels.
pub fn transfer_trade() -> TradeIntent {
    TradeIntent::new(
        TradeId::random(),
        TradeKind::Spot,
        buyer(),
        seller(),
        TradeProps::Spot(SpotProps {
            prop_id_for_sale: 7,
            prop_id_desired: 3,
            amount_for_sale: Quantity::from_units(5).unwrap(),
            amount_desired: Quantity::from_units(2).unwrap(),
            transfer_flag: true,
        }),
    )
    .unwrap()
}

pub fn futures_trade() -> TradeIntent {
    TradeIntent::new(
        TradeId::random(),
        TradeKind::Futures,
        buyer(),
        seller(),
        TradeProps::Futures(FuturesProps {
            contract_id: 4,
            amount: Quantity::from_units(10).unwrap(),
            price: "101.5".parse().unwrap(),
            collateral_property_id: 5,
            initial_margin: Quantity::from_units(20).unwrap(),
            transfer_flag: false,
        }),
    )
    .unwrap()
}

/// Shared view of the settlement chain.
#[derive(Default)]
pub struct Chain {
    txs: Mutex<HashMap<Txid, String>>,
    escrows: Mutex<HashMap<String, Script>>,
    broadcasts: Mutex<Vec<Txid>>,
    commit_payloads: Mutex<Vec<String>>,
    trade_payloads: Mutex<Vec<String>>,
    transient_failures: AtomicU32,
}

impl Chain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transactions accepted by the node, in order.
    pub fn broadcasts(&self) -> Vec<Txid> {
        self.broadcasts.lock().unwrap().clone()
    }

    /// Payloads of the commit and transfer transactions built so far.
    pub fn commit_payloads(&self) -> Vec<String> {
        self.commit_payloads.lock().unwrap().clone()
    }

    /// Payloads of the settlements built so far.
    pub fn trade_payloads(&self) -> Vec<String> {
        self.trade_payloads.lock().unwrap().clone()
    }

    /// Reject the next `n` broadcasts as if their inputs were not relayed yet.
    pub fn fail_next_broadcasts(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .map(|raw| transaction::decode_raw_tx(raw).unwrap())
    }
}

/// Node and wallet of one party.
pub struct Node {
    chain: Arc<Chain>,
    network: Network,
    sequence: u32,
    channel_balance: Quantity,
    finalizes_as_seller: bool,
    multisig_delay: Option<Duration>,
}

impl Node {
    fn with(chain: Arc<Chain>) -> Self {
        Self {
            chain,
            network: Network::Testnet,
            sequence: FINAL,
            channel_balance: Quantity::ZERO,
            finalizes_as_seller: false,
            multisig_delay: None,
        }
    }

    pub fn new(chain: Arc<Chain>) -> Arc<Self> {
        Arc::new(Self::with(chain))
    }

    /// A node reporting `balance` of every property in the party's current channel.
    pub fn with_channel_balance(chain: Arc<Chain>, balance: Quantity) -> Arc<Self> {
        Arc::new(Self {
            channel_balance: balance,
            ..Self::with(chain)
        })
    }

    /// A node whose commits signal replace-by-fee.
    pub fn replaceable(chain: Arc<Chain>) -> Arc<Self> {
        Arc::new(Self {
            sequence: REPLACEABLE,
            ..Self::with(chain)
        })
    }

    /// A node where the seller's signature completes the settlement.
    pub fn finalizing(chain: Arc<Chain>) -> Arc<Self> {
        Arc::new(Self {
            finalizes_as_seller: true,
            ..Self::with(chain)
        })
    }

    /// A node whose wallet takes `delay` to register a multisig.
    pub fn stalling(chain: Arc<Chain>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            multisig_delay: Some(delay),
            ..Self::with(chain)
        })
    }

    fn escrow_script(&self, channel: &str) -> Result<Script, Error> {
        self.chain
            .escrows
            .lock()
            .unwrap()
            .get(channel)
            .cloned()
            .ok_or_else(|| Error::Rejected(format!("unknown channel {}", channel)))
    }

    fn input(&self, previous_output: OutPoint, sequence: u32) -> TxIn {
        TxIn {
            previous_output,
            script_sig: Script::default(),
            sequence,
            witness: Witness::new(),
        }
    }
}

pub fn context(intent: &TradeIntent, node: Arc<Node>) -> SwapContext {
    SwapContext::new(intent.clone(), SwapConfig::default(), node.clone(), node)
}

#[async_trait]
impl TxGateway for Node {
    async fn build_commit_or_transfer(
        &self,
        _from: &str,
        to: &str,
        payload: &str,
        inputs: &[Utxo],
    ) -> Result<String, Error> {
        let script_pubkey = self.escrow_script(to)?;
        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: inputs
                .iter()
                .map(|utxo| self.input(utxo.outpoint(), self.sequence))
                .collect(),
            output: vec![
                TxOut {
                    value: ESCROW_SATS,
                    script_pubkey,
                },
                TxOut {
                    value: 0,
                    script_pubkey: Script::new_op_return(payload.as_bytes()),
                },
            ],
        };
        self.chain
            .commit_payloads
            .lock()
            .unwrap()
            .push(payload.to_string());
        Ok(encode::serialize_hex(&tx))
    }

    async fn build_native_commit(
        &self,
        _from: &str,
        to: &str,
        amount: bitcoin::Amount,
        inputs: &[Utxo],
    ) -> Result<String, Error> {
        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: inputs
                .iter()
                .map(|utxo| self.input(utxo.outpoint(), self.sequence))
                .collect(),
            output: vec![TxOut {
                value: amount.as_sat(),
                script_pubkey: self.escrow_script(to)?,
            }],
        };
        Ok(encode::serialize_hex(&tx))
    }

    async fn sign_raw_tx(&self, raw_hex: &str, _signer: &Signer) -> Result<String, Error> {
        Ok(raw_hex.to_string())
    }

    async fn send_raw_tx(&self, raw_hex: &str) -> Result<Txid, Error> {
        let failures = &self.chain.transient_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Rejected(
                "bad-txns-inputs-missingorspent (code -25)".to_string(),
            ));
        }
        let tx = transaction::decode_raw_tx(raw_hex).map_err(Error::new)?;
        let txid = tx.txid();
        self.chain
            .txs
            .lock()
            .unwrap()
            .insert(txid, raw_hex.to_string());
        self.chain.broadcasts.lock().unwrap().push(txid);
        Ok(txid)
    }

    async fn build_trade_tx(&self, request: &TradeTxRequest) -> Result<String, Error> {
        let input = request
            .commit_utxos
            .iter()
            .map(|utxo| utxo.outpoint())
            .chain(request.wallet_utxos.iter().map(|utxo| utxo.outpoint()))
            .map(|outpoint| self.input(outpoint, FINAL))
            .collect();
        let (payee, other) = match request.payee {
            SwapRole::Seller => (&request.seller, &request.buyer),
            SwapRole::Buyer => (&request.buyer, &request.seller),
        };
        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input,
            output: vec![
                TxOut {
                    value: request.amount.as_sat(),
                    script_pubkey: Script::new_op_return(payee.address.as_bytes()),
                },
                TxOut {
                    value: ESCROW_SATS,
                    script_pubkey: Script::new_op_return(other.address.as_bytes()),
                },
                TxOut {
                    value: 0,
                    script_pubkey: Script::new_op_return(request.payload.as_bytes()),
                },
            ],
        };
        let psbt = PartiallySignedTransaction::from_unsigned_tx(tx)
            .map_err(|e| Error::Rejected(e.to_string()))?;
        self.chain
            .trade_payloads
            .lock()
            .unwrap()
            .push(request.payload.clone());
        Ok(hex::encode(encode::serialize(&psbt)))
    }

    async fn sign_psbt(&self, psbt_hex: &str, role: SwapRole) -> Result<SignedPsbt, Error> {
        let psbt = transaction::decode_psbt(psbt_hex).map_err(Error::new)?;
        Ok(match role {
            SwapRole::Seller if self.finalizes_as_seller => SignedPsbt {
                psbt_hex: psbt_hex.to_string(),
                is_finished: true,
                final_hex: Some(encode::serialize_hex(&psbt.extract_tx())),
            },
            SwapRole::Seller => SignedPsbt {
                psbt_hex: psbt_hex.to_string(),
                is_finished: false,
                final_hex: None,
            },
            SwapRole::Buyer => SignedPsbt {
                psbt_hex: psbt_hex.to_string(),
                is_finished: true,
                final_hex: Some(encode::serialize_hex(&psbt.extract_tx())),
            },
        })
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<String, Error> {
        self.chain
            .txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::Rejected(format!("No such transaction {}", txid)))
    }

    async fn get_chain_height(&self) -> Result<u32, Error> {
        Ok(CHAIN_HEIGHT)
    }

    async fn channel_balance(&self, _address: &str, _property_id: u32) -> Result<Quantity, Error> {
        Ok(self.channel_balance)
    }

    async fn channel_column(&self, _channel: &str, address: &str) -> Result<Column, Error> {
        Ok(if address == seller().address {
            Column::A
        } else {
            Column::B
        })
    }
}

#[async_trait]
impl Wallet for Node {
    async fn add_multisig(&self, m: u8, pubkeys: &[PublicKey]) -> Result<MultisigInfo, Error> {
        if let Some(delay) = self.multisig_delay {
            tokio::time::sleep(delay).await;
        }
        if m != 2 || pubkeys.len() != 2 {
            return Err(Error::Rejected("only 2-of-2 is supported".to_string()));
        }
        let escrow = escrow::derive_escrow(self.network, &pubkeys[0], &pubkeys[1])
            .map_err(Error::new)?;
        self.chain
            .escrows
            .lock()
            .unwrap()
            .insert(escrow.address.clone(), escrow.script_pubkey.clone());
        Ok(MultisigInfo {
            address: escrow.address,
            redeem_script: hex::encode(escrow.redeem_script.as_bytes()),
        })
    }

    async fn list_unspent(&self, address: &str) -> Result<Vec<Utxo>, Error> {
        Ok(vec![Utxo {
            txid: Txid::hash(address.as_bytes()),
            vout: 0,
            amount: bitcoin::Amount::from_sat(WALLET_SATS),
            script_pubkey: Script::default(),
        }])
    }

    async fn dump_private_key(&self, _address: &str) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

/// Channel end keeping track of the tags it sent.
pub struct Recorded<C> {
    inner: C,
    log: Arc<Mutex<Vec<StepTag>>>,
    lost: Option<StepTag>,
}

impl<C> Recorded<C> {
    pub fn new(inner: C, log: Arc<Mutex<Vec<StepTag>>>) -> Self {
        Self {
            inner,
            log,
            lost: None,
        }
    }

    /// Events tagged `lost` are recorded but never delivered.
    pub fn losing(inner: C, log: Arc<Mutex<Vec<StepTag>>>, lost: StepTag) -> Self {
        Self {
            inner,
            log,
            lost: Some(lost),
        }
    }
}

#[async_trait]
impl<C: MessageChannel> MessageChannel for Recorded<C> {
    fn key(&self) -> &str {
        self.inner.key()
    }

    async fn send(&mut self, event: SwapEvent) -> Result<(), channel::Error> {
        self.log.lock().unwrap().push(event.event_name);
        if self.lost == Some(event.event_name) {
            return Ok(());
        }
        self.inner.send(event).await
    }

    async fn recv(&mut self) -> Option<SwapEvent> {
        self.inner.recv().await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}
