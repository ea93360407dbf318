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

//! Roles used to distinguish the two participants of a settlement.

use std::fmt::Debug;
use std::io;
use std::str::FromStr;

use crate::consensus::{self, Decodable, Encodable};

/// Possible roles during the swap phase. The seller holds the asset for sale and starts the
/// handshake by proposing the escrow, the buyer builds and broadcasts the settlement.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum SwapRole {
    /// Builds the settlement transaction, signs last and broadcasts.
    Buyer,
    /// Proposes the escrow, commits its leg first and co-signs the settlement.
    Seller,
}

impl SwapRole {
    /// Return the other role possible in the swap phase.
    pub fn other(&self) -> Self {
        match self {
            Self::Buyer => Self::Seller,
            Self::Seller => Self::Buyer,
        }
    }

    /// Prefix of the step tags emitted by this role.
    pub fn tag_prefix(&self) -> &'static str {
        match self {
            Self::Buyer => "BUYER",
            Self::Seller => "SELLER",
        }
    }
}

impl Encodable for SwapRole {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            SwapRole::Buyer => 0x01u8.consensus_encode(writer),
            SwapRole::Seller => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for SwapRole {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(SwapRole::Buyer),
            0x02u8 => Ok(SwapRole::Seller),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(SwapRole);

impl FromStr for SwapRole {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buyer" | "buyer" | "BUYER" => Ok(SwapRole::Buyer),
            "Seller" | "seller" | "SELLER" => Ok(SwapRole::Seller),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}
