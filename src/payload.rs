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

//! Meta-protocol instructions embedded in null-data outputs.
//!
//! A payload is the marker `tl`, a single base-36 transaction type digit and the base-36 fields of
//! the instruction joined by `,`. Amounts are fixed-point [`Quantity`] values: whole amounts are
//! encoded as the base-36 count of units, fractional ones as the base-36 count of base units
//! followed by `~`.
//!
//! ```rust
//! use tradelayer_swap::amount::Quantity;
//! use tradelayer_swap::payload::{self, CommitParams, Destination, Instruction};
//!
//! let commit = CommitParams {
//!     property_id: 7,
//!     amount: Quantity::from_units(5).unwrap(),
//!     channel: Destination::Ref(0),
//! };
//! let encoded = payload::encode_commit(&commit);
//! assert_eq!(encoded, "tl47,5,ref:0");
//! assert_eq!(payload::decode(&encoded).unwrap(), Instruction::Commit(commit));
//! ```

use std::fmt;
use std::str::FromStr;

use crate::amount::Quantity;
use crate::consensus::Error;

/// Marker prefixing every payload.
pub const MARKER: &str = "tl";

/// Separator between fields.
pub const DELIMITER: char = ',';

/// Suffix flagging an amount encoded in base units.
pub const FRACTIONAL_SUFFIX: char = '~';

/// Addresses longer than this are replaced by a reference to the output carrying them.
pub const MAX_INLINE_ADDRESS_LEN: usize = 42;

const REF_PREFIX: &str = "ref:";

/// Transaction type digits of the meta-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(Debug)]
pub enum TxType {
    TradeTokenForUtxo,
    Commit,
    Attestation,
    TradeContractChannel,
    TradeTokensChannel,
    Transfer,
}

impl TxType {
    /// Type number of the meta-protocol.
    pub fn to_u32(&self) -> u32 {
        match self {
            TxType::TradeTokenForUtxo => 3,
            TxType::Commit => 4,
            TxType::Attestation => 10,
            TxType::TradeContractChannel => 19,
            TxType::TradeTokensChannel => 20,
            TxType::Transfer => 22,
        }
    }

    /// Type from its number, `None` for types this crate does not settle with.
    pub fn from_u32(n: u32) -> Option<Self> {
        match n {
            3 => Some(TxType::TradeTokenForUtxo),
            4 => Some(TxType::Commit),
            10 => Some(TxType::Attestation),
            19 => Some(TxType::TradeContractChannel),
            20 => Some(TxType::TradeTokensChannel),
            22 => Some(TxType::Transfer),
            _ => None,
        }
    }

    fn digit(&self) -> char {
        // All type numbers are below 36
        std::char::from_digit(self.to_u32(), 36).unwrap_or('0')
    }
}

/// Target of an instruction: an inline address, or the index of the transaction output carrying
/// the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Address(String),
    Ref(u32),
}

impl Destination {
    /// Inline short addresses, reference long ones (multisig) by their output index.
    pub fn new(address: &str, output_index: u32) -> Self {
        if address.len() > MAX_INLINE_ADDRESS_LEN {
            Destination::Ref(output_index)
        } else {
            Destination::Address(address.to_string())
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Address(address) => write!(f, "{}", address),
            Destination::Ref(index) => write!(f, "{}{}", REF_PREFIX, index),
        }
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(REF_PREFIX) {
            Some(index) => index
                .parse::<u32>()
                .map(Destination::Ref)
                .map_err(Error::new),
            None if s.is_empty() => Err(Error::ParseFailed("empty destination")),
            None => Ok(Destination::Address(s.to_string())),
        }
    }
}

/// Lock an amount of a property into a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitParams {
    pub property_id: u32,
    pub amount: Quantity,
    pub channel: Destination,
}

/// Move an amount out of the sender's channel column into another channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferParams {
    pub property_id: u32,
    pub amount: Quantity,
    pub is_column_a: bool,
    pub destination: Destination,
}

/// Exchange two properties held in the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeTokensChannelParams {
    pub property_id_desired: u32,
    pub property_id_offered: u32,
    pub amount_desired: Quantity,
    pub amount_offered: Quantity,
    /// The offerer holds column A of the channel.
    pub column_a_is_offerer: bool,
    /// Last block the trade can be mined in.
    pub expiry_block: u32,
}

/// Open a futures position between the two columns of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeContractChannelParams {
    pub contract_id: u32,
    pub price: Quantity,
    /// Number of contracts.
    pub amount: Quantity,
    /// The seller holds column A of the channel.
    pub column_a_is_seller: bool,
    /// Last block the trade can be mined in.
    pub expiry_block: u32,
    pub insurance: bool,
}

/// Tokens held in a channel against native coins paid to an output of the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeTokenForUtxoParams {
    pub property_id: u32,
    pub amount: Quantity,
    /// The token sender holds column A of the channel.
    pub column_a: bool,
    pub sats_expected: Quantity,
    /// Output receiving the tokens.
    pub token_output: u32,
    /// Output receiving `sats_expected`.
    pub pay_to_output: u32,
}

/// Issue or revoke an attestation about a target address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttestationParams {
    pub revoke: bool,
    pub attestation_id: u32,
    pub target: Destination,
    pub metadata: Vec<u8>,
}

/// Any decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    Commit(CommitParams),
    Transfer(TransferParams),
    TradeTokensChannel(TradeTokensChannelParams),
    TradeContractChannel(TradeContractChannelParams),
    TradeTokenForUtxo(TradeTokenForUtxoParams),
    Attestation(AttestationParams),
}

impl Instruction {
    /// Transaction type of the instruction.
    pub fn tx_type(&self) -> TxType {
        match self {
            Instruction::Commit(_) => TxType::Commit,
            Instruction::Transfer(_) => TxType::Transfer,
            Instruction::TradeTokensChannel(_) => TxType::TradeTokensChannel,
            Instruction::TradeContractChannel(_) => TxType::TradeContractChannel,
            Instruction::TradeTokenForUtxo(_) => TxType::TradeTokenForUtxo,
            Instruction::Attestation(_) => TxType::Attestation,
        }
    }

    /// Encode the instruction into its payload string.
    pub fn encode(&self) -> String {
        match self {
            Instruction::Commit(p) => encode_commit(p),
            Instruction::Transfer(p) => encode_transfer(p),
            Instruction::TradeTokensChannel(p) => encode_trade_tokens_channel(p),
            Instruction::TradeContractChannel(p) => encode_trade_contract_channel(p),
            Instruction::TradeTokenForUtxo(p) => encode_trade_token_for_utxo(p),
            Instruction::Attestation(p) => encode_attestation(p),
        }
    }
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(std::char::from_digit((n % 36) as u32, 36).unwrap_or('0'));
        n /= 36;
    }
    digits.iter().rev().collect()
}

fn encode_amount(amount: &Quantity) -> String {
    if amount.is_whole() {
        to_base36(amount.whole_units())
    } else {
        format!("{}{}", to_base36(amount.as_base_units()), FRACTIONAL_SUFFIX)
    }
}

fn encode_bool(b: bool) -> String {
    let flag = if b { "1" } else { "0" };
    flag.to_string()
}

fn assemble(tx_type: TxType, fields: Vec<String>) -> String {
    format!("{}{}{}", MARKER, tx_type.digit(), fields.join(","))
}

/// Encode a commit of a token leg into the channel: `property, amount, channel`.
pub fn encode_commit(params: &CommitParams) -> String {
    assemble(
        TxType::Commit,
        vec![
            to_base36(params.property_id as u64),
            encode_amount(&params.amount),
            params.channel.to_string(),
        ],
    )
}

/// Encode a transfer from the sender's current channel into another one:
/// `property, amount, column, destination`.
pub fn encode_transfer(params: &TransferParams) -> String {
    assemble(
        TxType::Transfer,
        vec![
            to_base36(params.property_id as u64),
            encode_amount(&params.amount),
            encode_bool(params.is_column_a),
            params.destination.to_string(),
        ],
    )
}

/// Encode a token for token trade settled inside the channel:
/// `desired, offered, amount desired, amount offered, column A is offerer, expiry block`.
pub fn encode_trade_tokens_channel(params: &TradeTokensChannelParams) -> String {
    assemble(
        TxType::TradeTokensChannel,
        vec![
            to_base36(params.property_id_desired as u64),
            to_base36(params.property_id_offered as u64),
            encode_amount(&params.amount_desired),
            encode_amount(&params.amount_offered),
            encode_bool(params.column_a_is_offerer),
            to_base36(params.expiry_block as u64),
        ],
    )
}

/// Encode a futures position opened inside the channel:
/// `contract, price, amount, column A is seller, expiry block, insurance`.
pub fn encode_trade_contract_channel(params: &TradeContractChannelParams) -> String {
    assemble(
        TxType::TradeContractChannel,
        vec![
            to_base36(params.contract_id as u64),
            encode_amount(&params.price),
            encode_amount(&params.amount),
            encode_bool(params.column_a_is_seller),
            to_base36(params.expiry_block as u64),
            encode_bool(params.insurance),
        ],
    )
}

/// Encode a token for native coin trade. The token sender is identified by its column,
/// `sats_expected` must be paid at `pay_to_output` and the tokens go to `token_output`.
pub fn encode_trade_token_for_utxo(params: &TradeTokenForUtxoParams) -> String {
    assemble(
        TxType::TradeTokenForUtxo,
        vec![
            to_base36(params.property_id as u64),
            encode_amount(&params.amount),
            encode_bool(params.column_a),
            encode_amount(&params.sats_expected),
            to_base36(params.token_output as u64),
            to_base36(params.pay_to_output as u64),
        ],
    )
}

/// Encode an attestation: `revoke, id, target, hex(metadata)`.
pub fn encode_attestation(params: &AttestationParams) -> String {
    assemble(
        TxType::Attestation,
        vec![
            encode_bool(params.revoke),
            to_base36(params.attestation_id as u64),
            params.target.to_string(),
            hex::encode(&params.metadata),
        ],
    )
}

/// Reads the comma separated fields of a payload in order.
struct Fields<'a> {
    inner: std::str::Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn next_str(&mut self) -> Result<&'a str, Error> {
        self.inner
            .next()
            .ok_or(Error::ParseFailed("missing payload field"))
    }

    fn next_u64(&mut self) -> Result<u64, Error> {
        let field = self.next_str()?;
        if field.is_empty() {
            return Err(Error::ParseFailed("empty payload field"));
        }
        u64::from_str_radix(field, 36).map_err(Error::new)
    }

    fn next_u32(&mut self) -> Result<u32, Error> {
        u32::try_from(self.next_u64()?).map_err(Error::new)
    }

    fn next_bool(&mut self) -> Result<bool, Error> {
        match self.next_str()? {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(Error::ParseFailed("invalid payload flag")),
        }
    }

    fn next_amount(&mut self) -> Result<Quantity, Error> {
        let field = self.next_str()?;
        match field.strip_suffix(FRACTIONAL_SUFFIX) {
            Some(base_units) => u64::from_str_radix(base_units, 36)
                .map(Quantity::from_base_units)
                .map_err(Error::new),
            None => {
                let units = u64::from_str_radix(field, 36).map_err(Error::new)?;
                Quantity::from_units(units).ok_or(Error::ParseFailed("amount overflow"))
            }
        }
    }

    fn next_destination(&mut self) -> Result<Destination, Error> {
        self.next_str()?.parse()
    }

    fn finish(mut self) -> Result<(), Error> {
        match self.inner.next() {
            None => Ok(()),
            Some(_) => Err(Error::ParseFailed("unexpected trailing payload field")),
        }
    }
}

/// Decode a payload string, rejecting unknown markers and transaction types.
pub fn decode(payload: &str) -> Result<Instruction, Error> {
    let body = payload
        .strip_prefix(MARKER)
        .ok_or(Error::IncorrectMagicBytes)?;
    let mut chars = body.chars();
    let tx_type = chars
        .next()
        .and_then(|c| c.to_digit(36))
        .and_then(TxType::from_u32)
        .ok_or(Error::UnknownType)?;
    let mut fields = Fields {
        inner: chars.as_str().split(DELIMITER),
    };
    let instruction = match tx_type {
        TxType::Commit => Instruction::Commit(CommitParams {
            property_id: fields.next_u32()?,
            amount: fields.next_amount()?,
            channel: fields.next_destination()?,
        }),
        TxType::Transfer => Instruction::Transfer(TransferParams {
            property_id: fields.next_u32()?,
            amount: fields.next_amount()?,
            is_column_a: fields.next_bool()?,
            destination: fields.next_destination()?,
        }),
        TxType::TradeTokensChannel => Instruction::TradeTokensChannel(TradeTokensChannelParams {
            property_id_desired: fields.next_u32()?,
            property_id_offered: fields.next_u32()?,
            amount_desired: fields.next_amount()?,
            amount_offered: fields.next_amount()?,
            column_a_is_offerer: fields.next_bool()?,
            expiry_block: fields.next_u32()?,
        }),
        TxType::TradeContractChannel => {
            Instruction::TradeContractChannel(TradeContractChannelParams {
                contract_id: fields.next_u32()?,
                price: fields.next_amount()?,
                amount: fields.next_amount()?,
                column_a_is_seller: fields.next_bool()?,
                expiry_block: fields.next_u32()?,
                insurance: fields.next_bool()?,
            })
        }
        TxType::TradeTokenForUtxo => Instruction::TradeTokenForUtxo(TradeTokenForUtxoParams {
            property_id: fields.next_u32()?,
            amount: fields.next_amount()?,
            column_a: fields.next_bool()?,
            sats_expected: fields.next_amount()?,
            token_output: fields.next_u32()?,
            pay_to_output: fields.next_u32()?,
        }),
        TxType::Attestation => Instruction::Attestation(AttestationParams {
            revoke: fields.next_bool()?,
            attestation_id: fields.next_u32()?,
            target: fields.next_destination()?,
            metadata: hex::decode(fields.next_str()?).map_err(Error::new)?,
        }),
    };
    fields.finish()?;
    Ok(instruction)
}
