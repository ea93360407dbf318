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

//! Role specific state machines of the settlement. Each machine consumes one inbound event per
//! transition and produces at most one outbound payload, the [`crate::session`] runner drives
//! them over the message channel.

use std::sync::Arc;

use bitcoin::{Amount, Txid};
use tracing::info;

use crate::broadcast::broadcast_with_retry;
use crate::config::SwapConfig;
use crate::escrow::{self, EscrowChannel};
use crate::gateway::{self, TxGateway, Wallet};
use crate::payload::{self, CommitParams, Destination, TransferParams};
use crate::protocol::{self, StepPayload, StepTag, SwapEvent};
use crate::role::SwapRole;
use crate::session::SwapSession;
use crate::trade::TradeIntent;
use crate::transaction::{self, CommitUtxo, TxLabel};
use crate::{Error, Res};

pub mod buyer;
pub mod seller;

pub use buyer::{Buyer, BuyerState};
pub use seller::{Seller, SellerState};

/// Output index of the escrow in commit and transfer transactions, referenced by the payload.
pub const ESCROW_OUTPUT_REF: u32 = 0;

/// Everything a state machine needs besides the session data.
#[derive(Clone)]
pub struct SwapContext {
    pub intent: TradeIntent,
    pub config: SwapConfig,
    pub gateway: Arc<dyn TxGateway>,
    pub wallet: Arc<dyn Wallet>,
}

impl SwapContext {
    pub fn new(
        intent: TradeIntent,
        config: SwapConfig,
        gateway: Arc<dyn TxGateway>,
        wallet: Arc<dyn Wallet>,
    ) -> Self {
        Self {
            intent,
            config,
            gateway,
            wallet,
        }
    }
}

/// Outcome of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Send the payload and wait for the next event.
    Emit(StepPayload),
    /// Send the payload, the trade is settled.
    EmitAndComplete(StepPayload, Txid),
    /// The trade is settled.
    Complete(Txid),
}

/// State machine of either role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleMachine {
    Buyer(Buyer),
    Seller(Seller),
}

impl RoleMachine {
    pub fn new(role: SwapRole) -> Self {
        match role {
            SwapRole::Buyer => RoleMachine::Buyer(Buyer::new()),
            SwapRole::Seller => RoleMachine::Seller(Seller::new()),
        }
    }

    pub fn role(&self) -> SwapRole {
        match self {
            RoleMachine::Buyer(_) => SwapRole::Buyer,
            RoleMachine::Seller(_) => SwapRole::Seller,
        }
    }

    /// Tag of the next inbound event, `None` once terminal.
    pub fn expected(&self) -> Option<StepTag> {
        match self {
            RoleMachine::Buyer(buyer) => buyer.expected(),
            RoleMachine::Seller(seller) => seller.expected(),
        }
    }

    /// Payload emitted before any inbound event.
    pub async fn start(
        &mut self,
        ctx: &SwapContext,
        session: &mut SwapSession,
    ) -> Res<Option<StepPayload>> {
        match self {
            RoleMachine::Buyer(_) => Ok(None),
            RoleMachine::Seller(seller) => seller.start(ctx, session).await.map(Some),
        }
    }

    pub async fn advance(
        &mut self,
        ctx: &SwapContext,
        session: &mut SwapSession,
        event: SwapEvent,
    ) -> Res<Transition> {
        match self {
            RoleMachine::Buyer(buyer) => buyer.advance(ctx, session, event).await,
            RoleMachine::Seller(seller) => seller.advance(ctx, session, event).await,
        }
    }
}

/// Error for an event the current state does not accept.
pub(crate) fn unexpected(expected: StepTag, event: &SwapEvent) -> Error {
    Error::Protocol(protocol::Error::UnexpectedStep {
        expected,
        received: event.event_name,
    })
}

/// Derive the escrow of the trade and register it in the wallet.
pub(crate) async fn derive_and_import(ctx: &SwapContext) -> Res<EscrowChannel> {
    let escrow = escrow::derive_for_trade(ctx.config.network, &ctx.intent)?;
    let info = ctx
        .wallet
        .add_multisig(2, &escrow::ordered_keys(&ctx.intent))
        .await?;
    escrow.check_import(&info.address, &info.redeem_script)?;
    Ok(escrow)
}

/// Native coin to select for a transaction paying `amount` on top of its funding.
pub(crate) fn funding_target(config: &SwapConfig, amount: Amount) -> Res<Amount> {
    amount
        .checked_add(config.commit_funding_sats)
        .ok_or_else(|| transaction::Error::AmountOverflow.into())
}

/// Last block the settlement can be mined in.
pub(crate) fn expiry_block(config: &SwapConfig, height: u32) -> Res<u32> {
    height
        .checked_add(config.expiry_blocks)
        .ok_or_else(|| gateway::Error::InvalidChainHeight(height).into())
}

/// Lock the leg of `role` into the escrow. A native coin leg is paid into the escrow from the
/// wallet. A token leg uses a transfer from the party's current channel when allowed and covered
/// by its balance, otherwise a commit from the wallet.
pub(crate) async fn commit_leg(
    ctx: &SwapContext,
    role: SwapRole,
    escrow: &EscrowChannel,
) -> Res<CommitUtxo> {
    let party = ctx.intent.party(role);
    let leg = ctx.intent.leg(role);
    let gateway = ctx.gateway.as_ref();

    let (label, unsigned) = if leg.is_native() {
        let amount = leg.amount.as_native_amount();
        let utxos = ctx.wallet.list_unspent(&party.address).await?;
        let target = funding_target(&ctx.config, amount)?;
        let inputs = transaction::select_largest_first(utxos, target)?;
        let unsigned = gateway
            .build_native_commit(&party.address, &escrow.address, amount, &inputs)
            .await?;
        (TxLabel::Commit, unsigned)
    } else {
        let use_transfer = ctx.intent.transfer_flag()
            && gateway
                .channel_balance(&party.address, leg.property_id)
                .await?
                >= leg.amount;
        let destination = Destination::new(&escrow.address, ESCROW_OUTPUT_REF);
        let (label, instruction) = if use_transfer {
            let column = gateway
                .channel_column(&escrow.address, &party.address)
                .await?;
            let params = TransferParams {
                property_id: leg.property_id,
                amount: leg.amount,
                is_column_a: column.is_a(),
                destination,
            };
            (TxLabel::Transfer, payload::encode_transfer(&params))
        } else {
            let params = CommitParams {
                property_id: leg.property_id,
                amount: leg.amount,
                channel: destination,
            };
            (TxLabel::Commit, payload::encode_commit(&params))
        };
        let utxos = ctx.wallet.list_unspent(&party.address).await?;
        let inputs = transaction::select_largest_first(utxos, ctx.config.commit_funding_sats)?;
        let unsigned = gateway
            .build_commit_or_transfer(&party.address, &escrow.address, &instruction, &inputs)
            .await?;
        (label, unsigned)
    };
    let signer = gateway::signer_for(ctx.wallet.as_ref(), &party.address).await?;
    let signed = gateway.sign_raw_tx(&unsigned, &signer).await?;

    let tx = transaction::decode_raw_tx(&signed)?;
    let commit = CommitUtxo::from_commit_tx(&tx, escrow)?;
    let txid = broadcast_with_retry(gateway, &signed, &ctx.config.broadcast).await?;
    if txid != commit.txid {
        return Err(transaction::Error::InvalidTransactionChain.into());
    }
    info!(%txid, vout = commit.vout, %label, "collateral locked in escrow");
    Ok(commit)
}
