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

//! Seller side of the settlement: proposes the escrow, commits its leg first and co-signs the
//! buyer's settlement after checking the buyer commit cannot be replaced.

use bitcoin::Txid;
use tracing::{info, warn};

use crate::broadcast::broadcast_with_retry;
use crate::protocol::{self, StepPayload, StepTag, SwapEvent};
use crate::role::SwapRole;
use crate::session::SwapSession;
use crate::swap::{commit_leg, derive_and_import, unexpected, SwapContext, Transition};
use crate::transaction::{self, CommitUtxo};
use crate::Res;

/// Progress of the seller through the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(Debug)]
pub enum SellerState {
    /// The escrow is not proposed yet.
    Start,
    /// Escrow proposed, waiting for the buyer's acknowledgement.
    AwaitAck,
    /// Leg committed, waiting for the buyer's settlement.
    AwaitSettlement,
    /// Settlement co-signed, waiting for the buyer's broadcast.
    AwaitFinal,
    /// Settlement broadcast by either side.
    Complete,
}

/// Seller state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seller {
    state: SellerState,
}

impl Default for Seller {
    fn default() -> Self {
        Self::new()
    }
}

impl Seller {
    pub fn new() -> Self {
        Self {
            state: SellerState::Start,
        }
    }

    pub fn state(&self) -> SellerState {
        self.state
    }

    /// Tag of the next buyer event, `None` before the escrow is proposed and once complete.
    pub fn expected(&self) -> Option<StepTag> {
        match self.state {
            SellerState::AwaitAck => Some(StepTag::BuyerStep2),
            SellerState::AwaitSettlement => Some(StepTag::BuyerStep4),
            SellerState::AwaitFinal => Some(StepTag::BuyerStep6),
            SellerState::Start | SellerState::Complete => None,
        }
    }

    /// Derive the escrow and propose it.
    pub async fn start(&mut self, ctx: &SwapContext, session: &mut SwapSession) -> Res<StepPayload> {
        let escrow = derive_and_import(ctx).await?;
        info!(address = %escrow.address, "escrow derived");
        session.set_escrow(escrow.clone());
        self.state = SellerState::AwaitAck;
        Ok(StepPayload::Escrow(escrow))
    }

    /// Consume the next buyer event.
    pub async fn advance(
        &mut self,
        ctx: &SwapContext,
        session: &mut SwapSession,
        event: SwapEvent,
    ) -> Res<Transition> {
        let expected = match self.expected() {
            Some(tag) if tag == event.event_name => tag,
            Some(tag) => return Err(unexpected(tag, &event)),
            None => return Err(unexpected(StepTag::TerminateTrade, &event)),
        };
        match (self.state, event.data) {
            (SellerState::AwaitAck, StepPayload::Ack) => {
                let escrow = session.escrow()?.clone();
                let commit = commit_leg(ctx, SwapRole::Seller, &escrow).await?;
                session.set_pending_utxo(commit.clone());
                self.state = SellerState::AwaitSettlement;
                Ok(Transition::Emit(StepPayload::Commit(commit)))
            }
            (SellerState::AwaitSettlement, StepPayload::SettlementPsbt {
                psbt_hex,
                commit_txid,
            }) => {
                let transition = self.cosign(ctx, session, psbt_hex, commit_txid).await?;
                self.state = match transition {
                    Transition::Emit(_) => SellerState::AwaitFinal,
                    _ => SellerState::Complete,
                };
                Ok(transition)
            }
            (SellerState::AwaitFinal, StepPayload::Final { txid }) => {
                self.state = SellerState::Complete;
                Ok(Transition::Complete(txid))
            }
            _ => Err(protocol::Error::MalformedPayload(expected).into()),
        }
    }

    async fn cosign(
        &mut self,
        ctx: &SwapContext,
        session: &mut SwapSession,
        psbt_hex: String,
        commit_txid: Option<Txid>,
    ) -> Res<Transition> {
        let own_commit = session.pending_utxo()?.clone();
        let psbt = transaction::decode_psbt(&psbt_hex)?;
        transaction::check_spends_commit(&psbt, &own_commit)?;

        match commit_txid {
            Some(txid) => {
                let buyer_commit = verify_buyer_commit(ctx, session, txid).await?;
                transaction::check_spends_commit(&psbt, &buyer_commit)?;
            }
            // Only a buyer paying with wallet UTXOs has nothing in the escrow
            None if ctx.intent.native_payer() != Some(SwapRole::Buyer) => {
                return Err(protocol::Error::MalformedPayload(StepTag::BuyerStep4).into());
            }
            None => {}
        }

        let signed = ctx.gateway.sign_psbt(&psbt_hex, SwapRole::Seller).await?;
        session.set_pending_psbt_hex(signed.psbt_hex.clone());
        match (signed.is_finished, signed.final_hex) {
            (true, Some(final_hex)) => {
                let txid =
                    broadcast_with_retry(ctx.gateway.as_ref(), &final_hex, &ctx.config.broadcast)
                        .await?;
                info!(%txid, "settlement fully signed, broadcast by seller");
                let payload = StepPayload::CosignedPsbt {
                    psbt_hex: signed.psbt_hex,
                    final_txid: Some(txid),
                };
                Ok(Transition::EmitAndComplete(payload, txid))
            }
            _ => Ok(Transition::Emit(StepPayload::CosignedPsbt {
                psbt_hex: signed.psbt_hex,
                final_txid: None,
            })),
        }
    }
}

/// Fetch the buyer commit, reject it if replaceable and describe its escrow output.
async fn verify_buyer_commit(
    ctx: &SwapContext,
    session: &SwapSession,
    txid: Txid,
) -> Res<CommitUtxo> {
    let raw = ctx.gateway.get_raw_transaction(&txid).await?;
    let tx = transaction::decode_raw_tx(&raw)?;
    if tx.txid() != txid {
        return Err(protocol::Error::MalformedPayload(StepTag::BuyerStep4).into());
    }
    if transaction::is_rbf_signaling(&tx) {
        warn!(%txid, "buyer commit signals replace-by-fee");
        return Err(protocol::Error::RbfDetected(txid).into());
    }
    Ok(CommitUtxo::from_commit_tx(&tx, session.escrow()?)?)
}
