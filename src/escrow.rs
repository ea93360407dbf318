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

//! Two-of-two multisig escrow shared by the buyer and the seller. Both parties derive the escrow
//! independently from the two known public keys and must agree byte for byte before any value is
//! locked.

use std::io;

use bitcoin::bech32::{self, u5, ToBase32, Variant};
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Script};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::PublicKey;
use thiserror::Error;

use crate::blockchain::Network;
use crate::consensus::{self, CanonicalBytes, Decodable, Encodable};
use crate::role::SwapRole;
use crate::trade::TradeIntent;

/// Errors raised while deriving or importing an escrow.
#[derive(Error, Debug)]
pub enum Error {
    /// The escrow address cannot be encoded.
    #[error("Bech32 error: {0}")]
    Bech32(#[from] bech32::Error),
    /// The wallet registered a multisig different from the locally derived escrow.
    #[error("Wallet multisig import does not match the derived escrow")]
    ImportMismatch,
    /// The redeem script returned by the wallet is not valid hex.
    #[error("Invalid redeem script: {0}")]
    InvalidRedeemScript(#[from] hex::FromHexError),
}

/// Position of the keys in the 2-of-2 list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(Debug)]
pub enum KeyOrder {
    SellerFirst,
    BuyerFirst,
}

impl KeyOrder {
    /// The native coin payer's key goes first, otherwise the seller's.
    pub fn for_trade(intent: &TradeIntent) -> Self {
        match intent.native_payer() {
            Some(SwapRole::Buyer) => KeyOrder::BuyerFirst,
            _ => KeyOrder::SellerFirst,
        }
    }
}

/// The escrow where both parties lock their collateral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowChannel {
    pub address: String,
    pub redeem_script: Script,
    pub script_pubkey: Script,
}

impl EscrowChannel {
    /// Verify that the multisig the wallet registered is this escrow.
    pub fn check_import(&self, address: &str, redeem_script_hex: &str) -> Result<(), Error> {
        let redeem_script = Script::from(hex::decode(redeem_script_hex)?);
        if self.address == address && self.redeem_script == redeem_script {
            Ok(())
        } else {
            Err(Error::ImportMismatch)
        }
    }
}

impl Encodable for EscrowChannel {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.address.consensus_encode(s)?;
        len += self.redeem_script.as_canonical_bytes().consensus_encode(s)?;
        Ok(len + self.script_pubkey.as_canonical_bytes().consensus_encode(s)?)
    }
}

impl Decodable for EscrowChannel {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(EscrowChannel {
            address: Decodable::consensus_decode(d)?,
            redeem_script: Script::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            script_pubkey: Script::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
        })
    }
}

impl_strict_encoding!(EscrowChannel);

/// Build the `OP_2 <first> <second> OP_2 OP_CHECKMULTISIG` redeem script.
pub fn multisig_script(first: &PublicKey, second: &PublicKey) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_key(first)
        .push_key(second)
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

/// Derive the P2WSH escrow of the two keys in the given order, the address uses the network's
/// bech32 human readable part.
pub fn derive_escrow(
    network: Network,
    first: &PublicKey,
    second: &PublicKey,
) -> Result<EscrowChannel, Error> {
    let redeem_script = multisig_script(first, second);
    let program = sha256::Hash::hash(redeem_script.as_bytes());
    let mut data = vec![u5::try_from_u8(0)?];
    data.extend(program.into_inner().to_base32());
    let address = bech32::encode(network.bech32_hrp(), data, Variant::Bech32)?;
    Ok(EscrowChannel {
        address,
        script_pubkey: redeem_script.to_v0_p2wsh(),
        redeem_script,
    })
}

/// Keys of the trade in escrow order.
pub fn ordered_keys(intent: &TradeIntent) -> [PublicKey; 2] {
    let buyer = intent.buyer().pubkey;
    let seller = intent.seller().pubkey;
    match KeyOrder::for_trade(intent) {
        KeyOrder::BuyerFirst => [buyer, seller],
        KeyOrder::SellerFirst => [seller, buyer],
    }
}

/// Derive the escrow of a trade, applying the key ordering rule.
pub fn derive_for_trade(network: Network, intent: &TradeIntent) -> Result<EscrowChannel, Error> {
    let [first, second] = ordered_keys(intent);
    derive_escrow(network, &first, &second)
}

/// Return true if the escrow proposed by the counterparty is the one derived locally.
pub fn validate_escrow(local: &EscrowChannel, remote: &EscrowChannel) -> bool {
    local.address == remote.address
        && local.redeem_script == remote.redeem_script
        && local.script_pubkey == remote.script_pubkey
}
