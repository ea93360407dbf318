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

//! External collaborators the settlement drives: the transaction gateway building, signing and
//! relaying transactions, and the wallet holding the parties' keys. Both are async traits
//! implemented by the embedding application.

use std::error;

use async_trait::async_trait;
use bitcoin::{Amount, PublicKey, Txid};
use thiserror::Error;

use crate::amount::Quantity;
use crate::role::SwapRole;
use crate::transaction::{CommitUtxo, Utxo};

/// Errors returned by the gateway and the wallet.
#[derive(Error, Debug)]
pub enum Error {
    /// The gateway or the node refused the request, the message is kept verbatim.
    #[error("Gateway rejected the request: {0}")]
    Rejected(String),
    /// The signer refused to sign.
    #[error("Signing rejected: {0}")]
    SigningRejected(String),
    /// Broadcasting failed after the maximum number of attempts.
    #[error("Broadcast failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    /// The reported chain height leaves no room for the trade expiry.
    #[error("Chain height {0} is out of range")]
    InvalidChainHeight(u32),
    /// Any gateway error not part of this list.
    #[error("Gateway error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new gateway error of type other with an arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }
}

/// Ledger slot of a party in a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display(Debug)]
pub enum Column {
    A,
    B,
}

impl Column {
    pub fn is_a(&self) -> bool {
        matches!(self, Column::A)
    }
}

/// Key material used to sign a raw transaction.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signer {
    /// A private key exported by a local wallet.
    Wif(String),
    /// Let the wallet sign.
    Wallet,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signer::Wif(_) => write!(f, "Wif(..)"),
            Signer::Wallet => write!(f, "Wallet"),
        }
    }
}

/// A party of the settlement transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTxParty {
    pub address: String,
    pub pubkey: PublicKey,
}

/// Inputs to the settlement transaction builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTxRequest {
    pub buyer: TradeTxParty,
    pub seller: TradeTxParty,
    /// Escrow outputs spent by the settlement, the seller's commit first.
    pub commit_utxos: Vec<CommitUtxo>,
    /// Buyer wallet outputs paying the native coin leg.
    pub wallet_utxos: Vec<Utxo>,
    pub payload: String,
    /// Native coin paid at the pay-to output, zero for channel trades.
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub amount: Amount,
    /// Party owning the pay-to output, the other party owns the token output.
    pub payee: SwapRole,
}

/// Result of signing a PSBT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPsbt {
    pub psbt_hex: String,
    /// All inputs are signed and the transaction can be extracted.
    pub is_finished: bool,
    /// The extracted raw transaction when finished.
    pub final_hex: Option<String>,
}

/// A multisig registered in the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultisigInfo {
    pub address: String,
    pub redeem_script: String,
}

/// Builds, signs and relays transactions on the settlement chain.
#[async_trait]
pub trait TxGateway: Send + Sync {
    /// Build a commit or transfer transaction from `from` to the channel `to` carrying `payload`,
    /// funded by `inputs`. Returns the unsigned raw transaction hex.
    async fn build_commit_or_transfer(
        &self,
        from: &str,
        to: &str,
        payload: &str,
        inputs: &[Utxo],
    ) -> Result<String, Error>;

    /// Build a transaction locking `amount` of the native coin from `from` into the channel `to`,
    /// funded by `inputs`. Returns the unsigned raw transaction hex.
    async fn build_native_commit(
        &self,
        from: &str,
        to: &str,
        amount: Amount,
        inputs: &[Utxo],
    ) -> Result<String, Error>;

    /// Sign a raw transaction, returns the signed hex.
    async fn sign_raw_tx(&self, raw_hex: &str, signer: &Signer) -> Result<String, Error>;

    async fn send_raw_tx(&self, raw_hex: &str) -> Result<Txid, Error>;

    /// Build the settlement PSBT, returns its hex.
    async fn build_trade_tx(&self, request: &TradeTxRequest) -> Result<String, Error>;

    /// Sign the inputs the role controls. The seller never finalizes, the buyer finalizes when
    /// every input is signed.
    async fn sign_psbt(&self, psbt_hex: &str, role: SwapRole) -> Result<SignedPsbt, Error>;

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<String, Error>;

    async fn get_chain_height(&self) -> Result<u32, Error>;

    /// Balance the address has committed in its current channel.
    async fn channel_balance(&self, address: &str, property_id: u32) -> Result<Quantity, Error>;

    /// Column of the address in the channel.
    async fn channel_column(&self, channel: &str, address: &str) -> Result<Column, Error>;
}

/// Key and UTXO provider of a party.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Register an `m`-of-n multisig of the keys, in order.
    async fn add_multisig(&self, m: u8, pubkeys: &[PublicKey]) -> Result<MultisigInfo, Error>;

    async fn list_unspent(&self, address: &str) -> Result<Vec<Utxo>, Error>;

    /// Export the private key of an address, `None` for wallets that sign internally.
    async fn dump_private_key(&self, address: &str) -> Result<Option<String>, Error>;
}

/// Pick the signer of an address: an exported key when the wallet allows it.
pub async fn signer_for<W: Wallet + ?Sized>(wallet: &W, address: &str) -> Result<Signer, Error> {
    Ok(match wallet.dump_private_key(address).await? {
        Some(wif) => Signer::Wif(wif),
        None => Signer::Wallet,
    })
}
