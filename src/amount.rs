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

//! Fixed-point quantity used for token amounts, prices and native coin values. A [`Quantity`] is
//! stored in base units of `10^-8`, the same scale the meta-protocol applies before encoding.
//!
//! ```rust
//! use tradelayer_swap::amount::Quantity;
//!
//!# fn main() -> Result<(), tradelayer_swap::consensus::Error> {
//! let qty = "0.00000001".parse::<Quantity>()?;
//! assert_eq!(qty.as_base_units(), 1);
//!
//! // Displayed without trailing zeros
//! assert_eq!("2", format!("{}", Quantity::from_units(2).unwrap()));
//!# Ok(())
//!# }
//! ```

use std::fmt;
use std::io;
use std::str::FromStr;

use bitcoin::Amount;
use serde::ser::{Serialize, Serializer};
use serde::{de, Deserialize, Deserializer};

use crate::consensus::{self, Decodable, Encodable};

/// Number of base units in one whole unit.
pub const BASE_UNITS_PER_UNIT: u64 = 100_000_000;

/// Number of decimal places carried by a [`Quantity`].
pub const DECIMALS: usize = 8;

/// An amount in base units of `10^-8`.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Default)]
pub struct Quantity(u64);

impl Quantity {
    /// The zero quantity.
    pub const ZERO: Quantity = Quantity(0);

    /// Create a quantity from base units.
    pub fn from_base_units(units: u64) -> Self {
        Quantity(units)
    }

    /// Create a quantity of whole units, `None` on overflow.
    pub fn from_units(units: u64) -> Option<Self> {
        units.checked_mul(BASE_UNITS_PER_UNIT).map(Quantity)
    }

    /// Return the number of base units.
    pub fn as_base_units(&self) -> u64 {
        self.0
    }

    /// Return true if the quantity has no fractional part.
    pub fn is_whole(&self) -> bool {
        self.0 % BASE_UNITS_PER_UNIT == 0
    }

    /// Return the whole part of the quantity.
    pub fn whole_units(&self) -> u64 {
        self.0 / BASE_UNITS_PER_UNIT
    }

    pub fn checked_add(self, rhs: Quantity) -> Option<Quantity> {
        self.0.checked_add(rhs.0).map(Quantity)
    }

    pub fn checked_sub(self, rhs: Quantity) -> Option<Quantity> {
        self.0.checked_sub(rhs.0).map(Quantity)
    }

    /// Interpret the quantity as native coin value.
    pub fn as_native_amount(&self) -> Amount {
        Amount::from_sat(self.0)
    }
}

impl From<Amount> for Quantity {
    fn from(amount: Amount) -> Self {
        Quantity(amount.as_sat())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / BASE_UNITS_PER_UNIT;
        let frac = self.0 % BASE_UNITS_PER_UNIT;
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            let frac = format!("{:08}", frac);
            write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
        }
    }
}

impl FromStr for Quantity {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (whole, frac) = match s.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(consensus::Error::ParseFailed("empty quantity"));
        }
        if frac.len() > DECIMALS {
            return Err(consensus::Error::ParseFailed(
                "quantity has more than 8 decimal places",
            ));
        }
        if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(consensus::Error::ParseFailed("quantity is not a decimal number"));
        }
        let whole = match whole {
            "" => 0,
            w => w.parse::<u64>().map_err(consensus::Error::new)?,
        };
        let frac = match frac {
            "" => 0,
            f => format!("{:0<8}", f)
                .parse::<u64>()
                .map_err(consensus::Error::new)?,
        };
        whole
            .checked_mul(BASE_UNITS_PER_UNIT)
            .and_then(|w| w.checked_add(frac))
            .map(Quantity)
            .ok_or(consensus::Error::ParseFailed("quantity overflow"))
    }
}

impl Serialize for Quantity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{}", self).as_ref())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D>(deserializer: D) -> Result<Quantity, D::Error>
    where
        D: Deserializer<'de>,
    {
        Quantity::from_str(&String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

impl Encodable for Quantity {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for Quantity {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Quantity(Decodable::consensus_decode(d)?))
    }
}
