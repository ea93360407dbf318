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

//! TradeLayer swap core library, trustless two-party settlement of matched orders.
//!
//! A settlement is a six-step handshake between a buyer and a seller who share no custodian. Both
//! sides derive the same 2-of-2 multisig escrow, the seller commits its leg into the escrow, the
//! buyer builds a settlement transaction spending that collateral, and both co-sign it before the
//! buyer broadcasts.
//!
//! ```text
//! Seller                                  Buyer
//!   | --- SELLER:STEP1 (escrow) ----------> |
//!   | <-- BUYER:STEP2 (ack) --------------- |
//!   | --- SELLER:STEP3 (commit utxo) -----> |
//!   | <-- BUYER:STEP4 (psbt, commit txid) - |
//!   | --- SELLER:STEP5 (cosigned psbt) ---> |
//!   | <-- BUYER:STEP6 (final txid) -------- |
//! ```
//!
//! The crate does not build transaction bytes itself: a [`gateway::TxGateway`] and a
//! [`gateway::Wallet`] are injected and orchestrated by the [`swap`] state machines. Messages are
//! exchanged over an injected [`channel::MessageChannel`].

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate serde;

use thiserror::Error;

#[macro_use]
pub mod consensus;

pub mod amount;
pub mod blockchain;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod escrow;
pub mod gateway;
pub mod payload;
pub mod protocol;
pub mod role;
pub mod session;
pub mod swap;
pub mod trade;
pub mod transaction;

pub use uuid::Uuid;

/// Category of a failure, used to decide between retrying and terminating the trade.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum ErrorClass {
    /// The counterparty violated the protocol (bad escrow, wrong socket, RBF, malformed data).
    FatalProtocol,
    /// An external collaborator failed (signing, funds, gateway rejection).
    FatalExternal,
    /// The referenced inputs are not visible to the node yet, worth retrying.
    TransientBroadcast,
    /// The session deadline elapsed.
    Timeout,
}

/// A list of possible errors when settling a trade. Each error can have multiple level down to the
/// collaborator implementation.
#[derive(Error, Debug)]
pub enum Error {
    /// A consensus error during encoding/decoding operation or data type missmatch.
    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::Error),
    /// The escrow derivation failed or the two parties disagree on the escrow.
    #[error("Escrow error: {0}")]
    Escrow(#[from] escrow::Error),
    /// A transaction could not be decoded or does not have the expected shape.
    #[error("Transaction error: {0}")]
    Transaction(#[from] transaction::Error),
    /// The transaction gateway or the wallet failed.
    #[error("Gateway error: {0}")]
    Gateway(#[from] gateway::Error),
    /// The trade intent is not valid.
    #[error("Trade error: {0}")]
    Trade(#[from] trade::Error),
    /// The counterparty broke the protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::Error),
    /// The message channel failed.
    #[error("Channel error: {0}")]
    Channel(#[from] channel::Error),
    /// The counterparty terminated the trade with the given reason.
    #[error("Trade terminated by counterparty: {0}")]
    Terminated(String),
    /// The trade was cancelled locally.
    #[error("Trade cancelled: {0}")]
    Cancelled(String),
    /// The session deadline elapsed before reaching a terminal state.
    #[error("timeout")]
    Timeout,
}

impl Error {
    /// Classify the error in the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Timeout => ErrorClass::Timeout,
            Error::Gateway(gateway::Error::Rejected(msg))
                if broadcast::is_inputs_missing_or_spent(msg) =>
            {
                ErrorClass::TransientBroadcast
            }
            Error::Gateway(_) | Error::Channel(_) | Error::Cancelled(_) => {
                ErrorClass::FatalExternal
            }
            Error::Transaction(transaction::Error::NotEnoughAssets) => ErrorClass::FatalExternal,
            Error::Consensus(_)
            | Error::Escrow(_)
            | Error::Transaction(_)
            | Error::Trade(_)
            | Error::Protocol(_)
            | Error::Terminated(_) => ErrorClass::FatalProtocol,
        }
    }
}

/// Result of an high level computation such as in the swap state machines.
pub type Res<T> = Result<T, Error>;
