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

//! Step tags of the settlement handshake and the errors raised when the counterparty does not
//! follow them. The events themselves are defined in [`message`].

use std::fmt;
use std::io;
use std::str::FromStr;

use bitcoin::Txid;
use thiserror::Error;

use crate::consensus::{self, Decodable, Encodable};
use crate::role::SwapRole;

pub mod message;

pub use message::{StepPayload, SwapEvent};

/// Protocol violations by the counterparty.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The event does not follow the last one emitted.
    #[error("Unexpected step {received}, expected {expected}")]
    UnexpectedStep { expected: StepTag, received: StepTag },
    /// The event comes from another socket than the counterparty's.
    #[error("Event from socket {received}, expected {expected}")]
    WrongSocket { expected: String, received: String },
    /// The event data does not carry what its tag announces.
    #[error("Missing or malformed payload for {0}")]
    MalformedPayload(StepTag),
    /// Both parties derived different escrows.
    #[error("escrow mismatch")]
    EscrowMismatch,
    /// A step ran before the one producing its input.
    #[error("Session has no {0} yet")]
    MissingSessionData(&'static str),
    /// The counterparty commit signals replace-by-fee.
    #[error("Commit transaction {0} signals replace-by-fee")]
    RbfDetected(Txid),
}

/// Name of a swap event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepTag {
    #[serde(rename = "SELLER:STEP1")]
    SellerStep1,
    #[serde(rename = "BUYER:STEP2")]
    BuyerStep2,
    #[serde(rename = "SELLER:STEP3")]
    SellerStep3,
    #[serde(rename = "BUYER:STEP4")]
    BuyerStep4,
    #[serde(rename = "SELLER:STEP5")]
    SellerStep5,
    #[serde(rename = "BUYER:STEP6")]
    BuyerStep6,
    #[serde(rename = "TERMINATE_TRADE")]
    TerminateTrade,
}

impl StepTag {
    /// Handshake steps in order.
    pub const STEPS: [StepTag; 6] = [
        StepTag::SellerStep1,
        StepTag::BuyerStep2,
        StepTag::SellerStep3,
        StepTag::BuyerStep4,
        StepTag::SellerStep5,
        StepTag::BuyerStep6,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepTag::SellerStep1 => "SELLER:STEP1",
            StepTag::BuyerStep2 => "BUYER:STEP2",
            StepTag::SellerStep3 => "SELLER:STEP3",
            StepTag::BuyerStep4 => "BUYER:STEP4",
            StepTag::SellerStep5 => "SELLER:STEP5",
            StepTag::BuyerStep6 => "BUYER:STEP6",
            StepTag::TerminateTrade => "TERMINATE_TRADE",
        }
    }

    /// Position in the handshake, `None` for the termination.
    pub fn step(&self) -> Option<u8> {
        Self::STEPS
            .iter()
            .position(|tag| tag == self)
            .map(|i| i as u8 + 1)
    }

    /// Role allowed to emit the tag, `None` when both are.
    pub fn emitter(&self) -> Option<SwapRole> {
        match self.step()? % 2 {
            1 => Some(SwapRole::Seller),
            _ => Some(SwapRole::Buyer),
        }
    }

    /// Tag following this one in the handshake.
    pub fn next(&self) -> Option<StepTag> {
        let step = self.step()? as usize;
        Self::STEPS.get(step).copied()
    }

    fn to_u8(self) -> u8 {
        self.step().unwrap_or(0xff)
    }

    fn from_u8(n: u8) -> Option<Self> {
        match n {
            0xff => Some(StepTag::TerminateTrade),
            1..=6 => Self::STEPS.get(n as usize - 1).copied(),
            _ => None,
        }
    }
}

impl fmt::Display for StepTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepTag {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::STEPS
            .iter()
            .chain([StepTag::TerminateTrade].iter())
            .find(|tag| tag.as_str() == s)
            .copied()
            .ok_or(consensus::Error::UnknownType)
    }
}

impl Encodable for StepTag {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.to_u8().consensus_encode(writer)
    }
}

impl Decodable for StepTag {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        StepTag::from_u8(Decodable::consensus_decode(d)?).ok_or(consensus::Error::UnknownType)
    }
}

impl_strict_encoding!(StepTag);
