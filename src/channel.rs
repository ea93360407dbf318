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

//! Message channel carrying swap events between the two parties. The transport (relay socket,
//! reconnection) is owned by the embedding application, sessions only see this trait.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::SwapEvent;

/// Errors raised by a message channel.
#[derive(Error, Debug)]
pub enum Error {
    /// The channel is closed, no event can be sent.
    #[error("Channel {0} is closed")]
    Closed(String),
    /// Any transport error not part of this list.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Key of the swap channel of a socket.
pub fn channel_key(socket_id: &str) -> String {
    format!("{}::swap", socket_id)
}

/// Ordered delivery of swap events to and from the counterparty.
#[async_trait]
pub trait MessageChannel: Send {
    /// Key the channel is bound to.
    fn key(&self) -> &str;

    async fn send(&mut self, event: SwapEvent) -> Result<(), Error>;

    /// Next event from the counterparty, `None` once the remote side is gone.
    async fn recv(&mut self) -> Option<SwapEvent>;

    /// Stop sending, pending events are still delivered to the remote side.
    async fn close(&mut self);
}

/// One end of an in-memory channel pair.
#[derive(Debug)]
pub struct DuplexChannel {
    key: String,
    tx: Option<mpsc::UnboundedSender<SwapEvent>>,
    rx: mpsc::UnboundedReceiver<SwapEvent>,
}

/// Create two connected channel ends, keyed by the socket of their owner.
pub fn duplex(socket_a: &str, socket_b: &str) -> (DuplexChannel, DuplexChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        DuplexChannel {
            key: channel_key(socket_a),
            tx: Some(a_tx),
            rx: a_rx,
        },
        DuplexChannel {
            key: channel_key(socket_b),
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

#[async_trait]
impl MessageChannel for DuplexChannel {
    fn key(&self) -> &str {
        &self.key
    }

    async fn send(&mut self, event: SwapEvent) -> Result<(), Error> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Closed(self.key.clone()))?;
        tx.send(event)
            .map_err(|_| Error::Closed(self.key.clone()))
    }

    async fn recv(&mut self) -> Option<SwapEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}
