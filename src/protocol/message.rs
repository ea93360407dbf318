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

//! Swap events exchanged over the message channel.

use std::io;

use bitcoin::Txid;

use crate::consensus::{self, CanonicalBytes, Decodable, Encodable};
use crate::escrow::EscrowChannel;
use crate::protocol::StepTag;
use crate::transaction::CommitUtxo;

/// Data carried by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepPayload {
    /// `SELLER:STEP1`, the escrow proposed by the seller.
    Escrow(EscrowChannel),
    /// `BUYER:STEP2`, the buyer derived the same escrow.
    Ack,
    /// `SELLER:STEP3`, the seller collateral locked in the escrow.
    Commit(CommitUtxo),
    /// `BUYER:STEP4`, the settlement to co-sign and the buyer's own commit if any.
    #[serde(rename_all = "camelCase")]
    SettlementPsbt {
        psbt_hex: String,
        commit_txid: Option<Txid>,
    },
    /// `SELLER:STEP5`, the settlement signed by the seller. `final_txid` is set when the seller
    /// already broadcast a fully signed settlement.
    #[serde(rename_all = "camelCase")]
    CosignedPsbt {
        psbt_hex: String,
        final_txid: Option<Txid>,
    },
    /// `BUYER:STEP6`, the broadcast settlement.
    Final { txid: Txid },
    /// `TERMINATE_TRADE`
    Terminate { reason: String },
}

impl StepPayload {
    /// Tag announcing this payload.
    pub fn tag(&self) -> StepTag {
        match self {
            StepPayload::Escrow(_) => StepTag::SellerStep1,
            StepPayload::Ack => StepTag::BuyerStep2,
            StepPayload::Commit(_) => StepTag::SellerStep3,
            StepPayload::SettlementPsbt { .. } => StepTag::BuyerStep4,
            StepPayload::CosignedPsbt { .. } => StepTag::SellerStep5,
            StepPayload::Final { .. } => StepTag::BuyerStep6,
            StepPayload::Terminate { .. } => StepTag::TerminateTrade,
        }
    }

    fn decode_for<D: io::Read>(tag: StepTag, d: &mut D) -> Result<Self, consensus::Error> {
        Ok(match tag {
            StepTag::SellerStep1 => StepPayload::Escrow(Decodable::consensus_decode(d)?),
            StepTag::BuyerStep2 => StepPayload::Ack,
            StepTag::SellerStep3 => StepPayload::Commit(Decodable::consensus_decode(d)?),
            StepTag::BuyerStep4 => StepPayload::SettlementPsbt {
                psbt_hex: Decodable::consensus_decode(d)?,
                commit_txid: decode_txid_opt(d)?,
            },
            StepTag::SellerStep5 => StepPayload::CosignedPsbt {
                psbt_hex: Decodable::consensus_decode(d)?,
                final_txid: decode_txid_opt(d)?,
            },
            StepTag::BuyerStep6 => StepPayload::Final {
                txid: Txid::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            },
            StepTag::TerminateTrade => StepPayload::Terminate {
                reason: Decodable::consensus_decode(d)?,
            },
        })
    }
}

fn encode_txid_opt<W: io::Write>(txid: &Option<Txid>, s: &mut W) -> Result<usize, io::Error> {
    txid.map(|t| t.as_canonical_bytes()).consensus_encode(s)
}

fn decode_txid_opt<D: io::Read>(d: &mut D) -> Result<Option<Txid>, consensus::Error> {
    let bytes: Option<Vec<u8>> = Decodable::consensus_decode(d)?;
    bytes
        .map(|b| Txid::from_canonical_bytes(b.as_ref()))
        .transpose()
}

impl Encodable for StepPayload {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        match self {
            StepPayload::Escrow(escrow) => escrow.consensus_encode(s),
            StepPayload::Ack => Ok(0),
            StepPayload::Commit(utxo) => utxo.consensus_encode(s),
            StepPayload::SettlementPsbt {
                psbt_hex,
                commit_txid: txid,
            }
            | StepPayload::CosignedPsbt {
                psbt_hex,
                final_txid: txid,
            } => {
                let len = psbt_hex.consensus_encode(s)?;
                Ok(len + encode_txid_opt(txid, s)?)
            }
            StepPayload::Final { txid } => txid.as_canonical_bytes().consensus_encode(s),
            StepPayload::Terminate { reason } => reason.consensus_encode(s),
        }
    }
}

/// A message of the handshake, the tag always matches the payload when built with
/// [`SwapEvent::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEvent {
    pub event_name: StepTag,
    /// Socket of the emitter.
    pub socket_id: String,
    pub data: StepPayload,
}

impl SwapEvent {
    pub fn new(socket_id: impl Into<String>, data: StepPayload) -> Self {
        Self {
            event_name: data.tag(),
            socket_id: socket_id.into(),
            data,
        }
    }

    pub fn terminate(socket_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            socket_id,
            StepPayload::Terminate {
                reason: reason.into(),
            },
        )
    }

    /// Return true if the payload is the one the tag announces.
    pub fn is_consistent(&self) -> bool {
        self.event_name == self.data.tag()
    }
}

impl Encodable for SwapEvent {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        if !self.is_consistent() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event tag does not match its payload",
            ));
        }
        let mut len = self.event_name.consensus_encode(s)?;
        len += self.socket_id.consensus_encode(s)?;
        Ok(len + self.data.consensus_encode(s)?)
    }
}

impl Decodable for SwapEvent {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let event_name: StepTag = Decodable::consensus_decode(d)?;
        let socket_id = Decodable::consensus_decode(d)?;
        let data = StepPayload::decode_for(event_name, d)?;
        Ok(Self {
            event_name,
            socket_id,
            data,
        })
    }
}

impl_strict_encoding!(SwapEvent);
