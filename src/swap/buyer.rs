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

//! Buyer side of the settlement: acknowledges the escrow, builds the settlement spending the
//! seller's collateral, then finalizes and broadcasts it once co-signed.

use bitcoin::Amount;
use tracing::{info, warn};

use crate::broadcast::broadcast_with_retry;
use crate::escrow;
use crate::gateway::{self, TradeTxParty, TradeTxRequest};
use crate::payload::{
    self, TradeContractChannelParams, TradeTokenForUtxoParams, TradeTokensChannelParams,
};
use crate::protocol::{self, StepPayload, StepTag, SwapEvent};
use crate::role::SwapRole;
use crate::session::SwapSession;
use crate::swap::{
    commit_leg, derive_and_import, expiry_block, funding_target, unexpected, SwapContext,
    Transition,
};
use crate::trade::{Party, TradeProps};
use crate::transaction::{self, CommitUtxo};
use crate::Res;

/// Output receiving the tokens in a token for UTXO settlement.
pub const TOKEN_OUTPUT: u32 = 1;
/// Output receiving the native coin in a token for UTXO settlement.
pub const PAY_TO_OUTPUT: u32 = 0;

/// Progress of the buyer through the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(Debug)]
pub enum BuyerState {
    /// Waiting for the seller's escrow proposal, `SELLER:STEP1`.
    AwaitEscrow,
    /// Escrow acknowledged, waiting for the seller commit to build the settlement.
    BuildSettlement,
    /// Settlement sent, waiting for the seller's signature.
    AwaitCountersign,
    /// Broadcasting the finalized settlement.
    FinalizeAndBroadcast,
    /// Settlement broadcast.
    Complete,
}

/// Buyer state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buyer {
    state: BuyerState,
}

impl Default for Buyer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buyer {
    pub fn new() -> Self {
        Self {
            state: BuyerState::AwaitEscrow,
        }
    }

    pub fn state(&self) -> BuyerState {
        self.state
    }

    /// Tag of the next seller event, `None` once nothing more is awaited.
    pub fn expected(&self) -> Option<StepTag> {
        match self.state {
            BuyerState::AwaitEscrow => Some(StepTag::SellerStep1),
            BuyerState::BuildSettlement => Some(StepTag::SellerStep3),
            BuyerState::AwaitCountersign => Some(StepTag::SellerStep5),
            BuyerState::FinalizeAndBroadcast | BuyerState::Complete => None,
        }
    }

    /// Consume the next seller event.
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
            (BuyerState::AwaitEscrow, StepPayload::Escrow(remote)) => {
                let local = derive_and_import(ctx).await?;
                if !escrow::validate_escrow(&local, &remote) {
                    return Err(protocol::Error::EscrowMismatch.into());
                }
                info!(address = %local.address, "escrow validated");
                session.set_escrow(local);
                self.state = BuyerState::BuildSettlement;
                Ok(Transition::Emit(StepPayload::Ack))
            }
            (BuyerState::BuildSettlement, StepPayload::Commit(utxo)) => {
                let transition = self.build_settlement(ctx, session, utxo).await?;
                self.state = BuyerState::AwaitCountersign;
                Ok(transition)
            }
            (BuyerState::AwaitCountersign, StepPayload::CosignedPsbt {
                psbt_hex,
                final_txid,
            }) => {
                let built = transaction::decode_psbt(session.pending_psbt_hex()?)?;
                let returned = transaction::decode_psbt(&psbt_hex)?;
                transaction::check_same_unsigned(&built, &returned)?;

                let txid = match final_txid {
                    // Already broadcast by the seller
                    Some(txid) => {
                        if txid != returned.unsigned_tx.txid() {
                            return Err(protocol::Error::MalformedPayload(expected).into());
                        }
                        txid
                    }
                    None => {
                        let signed = ctx.gateway.sign_psbt(&psbt_hex, SwapRole::Buyer).await?;
                        let final_hex = match (signed.is_finished, signed.final_hex) {
                            (true, Some(final_hex)) => final_hex,
                            _ => {
                                return Err(gateway::Error::SigningRejected(
                                    "settlement is not fully signed".to_string(),
                                )
                                .into())
                            }
                        };
                        self.state = BuyerState::FinalizeAndBroadcast;
                        broadcast_with_retry(
                            ctx.gateway.as_ref(),
                            &final_hex,
                            &ctx.config.broadcast,
                        )
                        .await?
                    }
                };
                self.state = BuyerState::Complete;
                Ok(Transition::EmitAndComplete(StepPayload::Final { txid }, txid))
            }
            _ => Err(protocol::Error::MalformedPayload(expected).into()),
        }
    }

    async fn build_settlement(
        &mut self,
        ctx: &SwapContext,
        session: &mut SwapSession,
        seller_utxo: CommitUtxo,
    ) -> Res<Transition> {
        let escrow = session.escrow()?.clone();
        if seller_utxo.script_pubkey != escrow.script_pubkey
            || seller_utxo.redeem_script != escrow.redeem_script
        {
            return Err(protocol::Error::MalformedPayload(StepTag::SellerStep3).into());
        }
        verify_seller_commit(ctx, &seller_utxo).await?;

        let gateway = ctx.gateway.as_ref();
        let intent = &ctx.intent;
        let height = gateway.get_chain_height().await?;
        let expiry_block = expiry_block(&ctx.config, height)?;
        let seller_column = gateway
            .channel_column(&escrow.address, &intent.seller().address)
            .await?;

        let mut commit_utxos = vec![seller_utxo.clone()];
        let mut wallet_utxos = vec![];
        let mut amount = Amount::ZERO;
        let mut payee = SwapRole::Seller;
        let mut commit_txid = None;

        let instruction = match intent.props() {
            // Buyer pays with its wallet UTXOs, the seller's tokens sit in the escrow
            TradeProps::Spot(spot) if intent.native_payer() == Some(SwapRole::Buyer) => {
                amount = spot.amount_desired.as_native_amount();
                let utxos = ctx.wallet.list_unspent(&intent.buyer().address).await?;
                let target = funding_target(&ctx.config, amount)?;
                wallet_utxos = transaction::select_largest_first(utxos, target)?;
                payload::encode_trade_token_for_utxo(&TradeTokenForUtxoParams {
                    property_id: spot.prop_id_for_sale,
                    amount: spot.amount_for_sale,
                    column_a: seller_column.is_a(),
                    sats_expected: spot.amount_desired,
                    token_output: TOKEN_OUTPUT,
                    pay_to_output: PAY_TO_OUTPUT,
                })
            }
            // Seller's coins sit in the escrow, the buyer locks its tokens next to them
            TradeProps::Spot(spot) if intent.native_payer() == Some(SwapRole::Seller) => {
                amount = spot.amount_for_sale.as_native_amount();
                if seller_utxo.amount < amount {
                    return Err(protocol::Error::MalformedPayload(StepTag::SellerStep3).into());
                }
                payee = SwapRole::Buyer;
                let own = commit_leg(ctx, SwapRole::Buyer, &escrow).await?;
                commit_txid = Some(own.txid);
                commit_utxos.push(own);
                let buyer_column = gateway
                    .channel_column(&escrow.address, &intent.buyer().address)
                    .await?;
                payload::encode_trade_token_for_utxo(&TradeTokenForUtxoParams {
                    property_id: spot.prop_id_desired,
                    amount: spot.amount_desired,
                    column_a: buyer_column.is_a(),
                    sats_expected: spot.amount_for_sale,
                    token_output: TOKEN_OUTPUT,
                    pay_to_output: PAY_TO_OUTPUT,
                })
            }
            TradeProps::Spot(spot) => {
                let own = commit_leg(ctx, SwapRole::Buyer, &escrow).await?;
                commit_txid = Some(own.txid);
                commit_utxos.push(own);
                payload::encode_trade_tokens_channel(&TradeTokensChannelParams {
                    property_id_desired: spot.prop_id_desired,
                    property_id_offered: spot.prop_id_for_sale,
                    amount_desired: spot.amount_desired,
                    amount_offered: spot.amount_for_sale,
                    column_a_is_offerer: seller_column.is_a(),
                    expiry_block,
                })
            }
            TradeProps::Futures(futures) => {
                let own = commit_leg(ctx, SwapRole::Buyer, &escrow).await?;
                commit_txid = Some(own.txid);
                commit_utxos.push(own);
                payload::encode_trade_contract_channel(&TradeContractChannelParams {
                    contract_id: futures.contract_id,
                    price: futures.price,
                    amount: futures.amount,
                    column_a_is_seller: seller_column.is_a(),
                    expiry_block,
                    insurance: false,
                })
            }
        };

        let request = TradeTxRequest {
            buyer: tx_party(intent.buyer()),
            seller: tx_party(intent.seller()),
            commit_utxos,
            wallet_utxos,
            payload: instruction,
            amount,
            payee,
        };
        let psbt_hex = gateway.build_trade_tx(&request).await?;
        let psbt = transaction::decode_psbt(&psbt_hex)?;
        transaction::check_spends_commit(&psbt, &seller_utxo)?;
        info!(expiry_block, settlement = %psbt.unsigned_tx.txid(), "settlement built");

        session.set_pending_utxo(seller_utxo);
        session.set_pending_psbt_hex(psbt_hex.clone());
        Ok(Transition::Emit(StepPayload::SettlementPsbt {
            psbt_hex,
            commit_txid,
        }))
    }
}

fn tx_party(party: &Party) -> TradeTxParty {
    TradeTxParty {
        address: party.address.clone(),
        pubkey: party.pubkey,
    }
}

/// The seller commit must exist, pay the escrow the announced amount and not be replaceable.
async fn verify_seller_commit(ctx: &SwapContext, utxo: &CommitUtxo) -> Res<()> {
    let raw = ctx.gateway.get_raw_transaction(&utxo.txid).await?;
    let tx = transaction::decode_raw_tx(&raw)?;
    let output = tx
        .output
        .get(utxo.vout as usize)
        .ok_or(transaction::Error::MissingUTXO)?;
    if tx.txid() != utxo.txid
        || output.script_pubkey != utxo.script_pubkey
        || output.value != utxo.amount.as_sat()
    {
        return Err(protocol::Error::MalformedPayload(StepTag::SellerStep3).into());
    }
    if transaction::is_rbf_signaling(&tx) {
        warn!(txid = %utxo.txid, "seller commit signals replace-by-fee");
        return Err(protocol::Error::RbfDetected(utxo.txid).into());
    }
    Ok(())
}
