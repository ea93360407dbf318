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

//! Local inspection of the transactions returned by the gateway: decoding, escrow output lookup,
//! coin selection and the checks run on the settlement chain before signing.

use std::error;
use std::io;

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxOut};
use bitcoin::consensus::encode;
use bitcoin::util::psbt::PartiallySignedTransaction;
use bitcoin::{Amount, Txid};
use thiserror::Error;

use crate::consensus::{self, CanonicalBytes, Decodable, Encodable};
use crate::escrow::EscrowChannel;

/// Sequence number at or above which an input does not signal opt-in replace-by-fee.
pub const RBF_THRESHOLD: u32 = 0xFFFF_FFFE;

/// A list specifying general categories of transaction error.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing UTXO.
    #[error("Missing UTXO")]
    MissingUTXO,
    /// No output of the transaction pays the escrow.
    #[error("No output pays the escrow")]
    MissingEscrowOutput,
    /// Not enough assets to create the transaction.
    #[error("Not enough assets to create the transaction")]
    NotEnoughAssets,
    /// The amount to fund does not fit in a transaction output.
    #[error("Amount overflow")]
    AmountOverflow,
    /// Wrong transaction template.
    #[error("Wrong transaction template: {0}")]
    WrongTemplate(&'static str),
    /// The transaction chain validation failed
    #[error("The transaction chain validation failed")]
    InvalidTransactionChain,
    /// The transaction or PSBT cannot be decoded.
    #[error("Decoding error: {0}")]
    Decode(#[from] encode::Error),
    /// The transaction hex is not valid.
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),
    /// Any transaction error not part of this list.
    #[error("Transaction error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new transaction error of type other with an arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }
}

/// Defines the transaction labels used in logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(Debug)]
pub enum TxLabel {
    /// Locks a party's leg into the escrow from its wallet.
    Commit,
    /// Moves a party's leg into the escrow from a pre-existing channel.
    Transfer,
    /// Spends the commits and settles the trade.
    Settlement,
}

/// A spendable output of a wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub amount: Amount,
    pub script_pubkey: Script,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Collateral locked at the escrow address by a commit or transfer transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitUtxo {
    pub txid: Txid,
    pub vout: u32,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub amount: Amount,
    pub script_pubkey: Script,
    pub redeem_script: Script,
}

impl CommitUtxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    /// Locate the escrow output of a commit transaction and describe it.
    pub fn from_commit_tx(tx: &Transaction, escrow: &EscrowChannel) -> Result<Self, Error> {
        let (vout, output) = find_escrow_output(tx, escrow)?;
        Ok(CommitUtxo {
            txid: tx.txid(),
            vout,
            amount: Amount::from_sat(output.value),
            script_pubkey: output.script_pubkey.clone(),
            redeem_script: escrow.redeem_script.clone(),
        })
    }
}

impl Encodable for CommitUtxo {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.txid.as_canonical_bytes().consensus_encode(s)?;
        len += self.vout.consensus_encode(s)?;
        len += self.amount.as_sat().consensus_encode(s)?;
        len += self.script_pubkey.as_canonical_bytes().consensus_encode(s)?;
        Ok(len + self.redeem_script.as_canonical_bytes().consensus_encode(s)?)
    }
}

impl Decodable for CommitUtxo {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(CommitUtxo {
            txid: Txid::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            vout: Decodable::consensus_decode(d)?,
            amount: Amount::from_sat(Decodable::consensus_decode(d)?),
            script_pubkey: Script::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            redeem_script: Script::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
        })
    }
}

impl_strict_encoding!(CommitUtxo);

/// Decode a hex encoded raw transaction.
pub fn decode_raw_tx(raw_hex: &str) -> Result<Transaction, Error> {
    Ok(encode::deserialize(&hex::decode(raw_hex)?)?)
}

/// Decode a hex encoded PSBT.
pub fn decode_psbt(psbt_hex: &str) -> Result<PartiallySignedTransaction, Error> {
    Ok(encode::deserialize(&hex::decode(psbt_hex)?)?)
}

/// Find the output paying the escrow by script match, never by position.
pub fn find_escrow_output<'a>(
    tx: &'a Transaction,
    escrow: &EscrowChannel,
) -> Result<(u32, &'a TxOut), Error> {
    tx.output
        .iter()
        .enumerate()
        .find(|(_, output)| output.script_pubkey == escrow.script_pubkey)
        .map(|(vout, output)| (vout as u32, output))
        .ok_or(Error::MissingEscrowOutput)
}

/// Select UTXOs largest first until the target is covered.
pub fn select_largest_first(mut utxos: Vec<Utxo>, target: Amount) -> Result<Vec<Utxo>, Error> {
    utxos.sort_by(|a, b| b.amount.cmp(&a.amount));
    let mut selected = vec![];
    let mut total = Amount::ZERO;
    for utxo in utxos {
        if total >= target {
            break;
        }
        total = total.checked_add(utxo.amount).ok_or(Error::AmountOverflow)?;
        selected.push(utxo);
    }
    if total < target {
        return Err(Error::NotEnoughAssets);
    }
    Ok(selected)
}

/// Return true if any input of the transaction signals opt-in replace-by-fee.
pub fn is_rbf_signaling(tx: &Transaction) -> bool {
    tx.input.iter().any(|input| input.sequence < RBF_THRESHOLD)
}

/// Check that the settlement spends the given output.
pub fn check_spends(psbt: &PartiallySignedTransaction, outpoint: OutPoint) -> Result<(), Error> {
    psbt.unsigned_tx
        .input
        .iter()
        .any(|input| input.previous_output == outpoint)
        .then(|| ())
        .ok_or(Error::InvalidTransactionChain)
}

/// Check that the settlement spends the commit.
pub fn check_spends_commit(
    psbt: &PartiallySignedTransaction,
    commit: &CommitUtxo,
) -> Result<(), Error> {
    check_spends(psbt, commit.outpoint())
}

/// Check that a co-signed PSBT still carries the transaction that was built.
pub fn check_same_unsigned(
    built: &PartiallySignedTransaction,
    returned: &PartiallySignedTransaction,
) -> Result<(), Error> {
    (built.unsigned_tx.txid() == returned.unsigned_tx.txid())
        .then(|| ())
        .ok_or(Error::WrongTemplate("the settlement transaction changed"))
}
