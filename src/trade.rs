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

//! Trade structures. A [`TradeIntent`] describes a matched order negotiated outside of this crate
//! (by the relay) and is immutable once the settlement starts.
//!
//! A trade has two legs, the asset the seller gives and the asset the buyer gives in exchange:
//!
//! - Spot trades exchange `amount_for_sale` of `prop_id_for_sale` against `amount_desired` of
//!   `prop_id_desired`. When either property is the native coin the trade is a UTXO trade: the
//!   native coin is paid outside of the channel and the settlement is a single combined
//!   transaction.
//! - Futures trades open a position on `contract_id`, each side posting `initial_margin` of
//!   `collateral_property_id` into the channel.

use bitcoin::PublicKey;
use thiserror::Error;

use crate::amount::Quantity;
use crate::blockchain::NATIVE_PROPERTY_ID;
use crate::role::SwapRole;
use crate::Uuid;

/// Errors raised when a trade intent is not consistent.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The declared trade type does not match the populated properties.
    #[error("Trade type {0} does not match its properties")]
    KindMismatch(TradeKind),
    /// Both legs reference the same property.
    #[error("Both legs of the trade reference the same property")]
    IdenticalProperties,
    /// Buyer and seller share the same public key.
    #[error("Buyer and seller must use distinct public keys")]
    IdenticalParties,
    /// A leg amount is zero.
    #[error("Trade amounts must be strictly positive")]
    ZeroAmount,
    /// Futures collateral must be a channel token.
    #[error("Futures collateral cannot be the native coin")]
    NativeCollateral,
}

/// The identifier of a trade. This is a wrapper around [`Uuid`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[serde(transparent)]
#[display(inner)]
pub struct TradeId(pub Uuid);

impl TradeId {
    /// Generate a random trade identifier.
    pub fn random() -> Self {
        TradeId(Uuid::new_v4())
    }
}

impl From<Uuid> for TradeId {
    fn from(u: Uuid) -> Self {
        TradeId(u)
    }
}

/// Type of trade being settled.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeKind {
    Spot,
    Futures,
}

/// A participant of the trade as known before the settlement starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    /// Address holding the party's funds and receiving its side of the settlement.
    pub address: String,
    /// Public key used in the 2-of-2 escrow.
    pub pubkey: PublicKey,
    /// Socket identifier of the party on the relay.
    pub channel_id: String,
}

impl Party {
    pub fn new(address: impl Into<String>, pubkey: PublicKey, channel_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            pubkey,
            channel_id: channel_id.into(),
        }
    }
}

/// Spot trade parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotProps {
    /// Property given by the seller.
    pub prop_id_for_sale: u32,
    /// Property given by the buyer.
    pub prop_id_desired: u32,
    pub amount_for_sale: Quantity,
    pub amount_desired: Quantity,
    /// Allow moving collateral from a pre-existing channel instead of committing from the wallet.
    pub transfer_flag: bool,
}

/// Futures trade parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesProps {
    pub contract_id: u32,
    /// Number of contracts.
    pub amount: Quantity,
    pub price: Quantity,
    pub collateral_property_id: u32,
    /// Margin posted by each side.
    pub initial_margin: Quantity,
    pub transfer_flag: bool,
}

/// Closed set of trade parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeProps {
    Spot(SpotProps),
    Futures(FuturesProps),
}

impl TradeProps {
    pub fn kind(&self) -> TradeKind {
        match self {
            TradeProps::Spot(_) => TradeKind::Spot,
            TradeProps::Futures(_) => TradeKind::Futures,
        }
    }
}

/// One side of a trade: what a party puts into the escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Leg {
    pub property_id: u32,
    pub amount: Quantity,
}

impl Leg {
    /// Return true if the leg is paid with the chain native coin.
    pub fn is_native(&self) -> bool {
        self.property_id == NATIVE_PROPERTY_ID
    }
}

/// A matched order ready to be settled. Deserialization goes through [`TradeIntent::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "UncheckedTradeIntent")]
pub struct TradeIntent {
    id: TradeId,
    buyer: Party,
    seller: Party,
    props: TradeProps,
}

#[derive(Deserialize)]
struct UncheckedTradeIntent {
    id: TradeId,
    buyer: Party,
    seller: Party,
    props: TradeProps,
}

impl TryFrom<UncheckedTradeIntent> for TradeIntent {
    type Error = Error;

    fn try_from(intent: UncheckedTradeIntent) -> Result<Self, Error> {
        TradeIntent::new(
            intent.id,
            intent.props.kind(),
            intent.buyer,
            intent.seller,
            intent.props,
        )
    }
}

impl TradeIntent {
    /// Create a trade intent, validating that the declared kind matches the properties and that
    /// the legs are settleable.
    pub fn new(
        id: TradeId,
        kind: TradeKind,
        buyer: Party,
        seller: Party,
        props: TradeProps,
    ) -> Result<Self, Error> {
        if props.kind() != kind {
            return Err(Error::KindMismatch(kind));
        }
        if buyer.pubkey == seller.pubkey {
            return Err(Error::IdenticalParties);
        }
        match props {
            TradeProps::Spot(spot) => {
                if spot.prop_id_for_sale == spot.prop_id_desired {
                    return Err(Error::IdenticalProperties);
                }
                if spot.amount_for_sale == Quantity::ZERO || spot.amount_desired == Quantity::ZERO
                {
                    return Err(Error::ZeroAmount);
                }
            }
            TradeProps::Futures(futures) => {
                if futures.amount == Quantity::ZERO || futures.initial_margin == Quantity::ZERO {
                    return Err(Error::ZeroAmount);
                }
                if futures.collateral_property_id == NATIVE_PROPERTY_ID {
                    return Err(Error::NativeCollateral);
                }
            }
        }
        Ok(Self {
            id,
            buyer,
            seller,
            props,
        })
    }

    pub fn id(&self) -> TradeId {
        self.id
    }

    pub fn kind(&self) -> TradeKind {
        self.props.kind()
    }

    pub fn buyer(&self) -> &Party {
        &self.buyer
    }

    pub fn seller(&self) -> &Party {
        &self.seller
    }

    pub fn props(&self) -> &TradeProps {
        &self.props
    }

    /// Return the participant playing the given role.
    pub fn party(&self, role: SwapRole) -> &Party {
        match role {
            SwapRole::Buyer => &self.buyer,
            SwapRole::Seller => &self.seller,
        }
    }

    /// Return what the given role puts into the escrow.
    pub fn leg(&self, role: SwapRole) -> Leg {
        match (&self.props, role) {
            (TradeProps::Spot(spot), SwapRole::Seller) => Leg {
                property_id: spot.prop_id_for_sale,
                amount: spot.amount_for_sale,
            },
            (TradeProps::Spot(spot), SwapRole::Buyer) => Leg {
                property_id: spot.prop_id_desired,
                amount: spot.amount_desired,
            },
            (TradeProps::Futures(futures), _) => Leg {
                property_id: futures.collateral_property_id,
                amount: futures.initial_margin,
            },
        }
    }

    pub fn transfer_flag(&self) -> bool {
        match &self.props {
            TradeProps::Spot(spot) => spot.transfer_flag,
            TradeProps::Futures(futures) => futures.transfer_flag,
        }
    }

    /// Return the role paying with the native coin, if any.
    pub fn native_payer(&self) -> Option<SwapRole> {
        [SwapRole::Seller, SwapRole::Buyer]
            .into_iter()
            .find(|role| self.leg(*role).is_native())
    }

    /// Return true if the settlement is a single combined transaction trading tokens against
    /// native coin, paid by either side.
    pub fn is_utxo_trade(&self) -> bool {
        self.native_payer().is_some()
    }
}
