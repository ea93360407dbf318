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

//! Settlement configuration, loaded by the embedding application from any serde format.

use std::time::Duration;

use bitcoin::Amount;

use crate::blockchain::Network;
use crate::broadcast::RetryPolicy;

/// Parameters shared by every session of a party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// Network of the settlement chain, selects the escrow address prefix.
    pub network: Network,
    /// Lifetime of a session before it terminates with a timeout.
    pub timeout_ms: u64,
    /// Push the deadline back each time a step completes.
    pub renew_deadline_on_progress: bool,
    /// Blocks added to the chain height to compute the trade expiry.
    pub expiry_blocks: u32,
    pub broadcast: RetryPolicy,
    /// Minimum native coin selected to fund a commit or transfer transaction.
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub commit_funding_sats: Amount,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            timeout_ms: 60_000,
            renew_deadline_on_progress: false,
            expiry_blocks: 10,
            broadcast: RetryPolicy::default(),
            commit_funding_sats: Amount::from_sat(10_000),
        }
    }
}

impl SwapConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
