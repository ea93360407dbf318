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

//! Settlement sessions. A [`Swap`] owns the state machine of one role, the data collected along
//! the handshake and the message channel to the counterparty. It runs until the trade settles or
//! terminates, never both, and emits at most one `TERMINATE_TRADE`.

use std::future;

use bitcoin::Txid;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::{self, MessageChannel};
use crate::escrow::EscrowChannel;
use crate::protocol::{self, StepPayload, StepTag, SwapEvent};
use crate::role::SwapRole;
use crate::swap::{unexpected, RoleMachine, SwapContext, Transition};
use crate::trade::TradeId;
use crate::transaction::CommitUtxo;
use crate::{Error, ErrorClass, Res};

/// Data of one trade attempt, filled step by step and dropped with the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapSession {
    role: SwapRole,
    current_step: Option<StepTag>,
    escrow: Option<EscrowChannel>,
    pending_utxo: Option<CommitUtxo>,
    pending_psbt_hex: Option<String>,
    started_at: Instant,
    deadline: Instant,
    terminated: bool,
}

fn fill<T>(slot: &mut Option<T>, value: T) {
    debug_assert!(slot.is_none(), "session data is populated once");
    *slot = Some(value);
}

impl SwapSession {
    pub fn new(role: SwapRole, timeout: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            role,
            current_step: None,
            escrow: None,
            pending_utxo: None,
            pending_psbt_hex: None,
            started_at,
            deadline: started_at + timeout,
            terminated: false,
        }
    }

    pub fn role(&self) -> SwapRole {
        self.role
    }

    /// Last step sent or received.
    pub fn current_step(&self) -> Option<StepTag> {
        self.current_step
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn escrow(&self) -> Res<&EscrowChannel> {
        self.escrow
            .as_ref()
            .ok_or(Error::Protocol(protocol::Error::MissingSessionData("escrow")))
    }

    pub fn set_escrow(&mut self, escrow: EscrowChannel) {
        fill(&mut self.escrow, escrow);
    }

    pub fn pending_utxo(&self) -> Res<&CommitUtxo> {
        self.pending_utxo
            .as_ref()
            .ok_or(Error::Protocol(protocol::Error::MissingSessionData("commit")))
    }

    pub fn set_pending_utxo(&mut self, utxo: CommitUtxo) {
        fill(&mut self.pending_utxo, utxo);
    }

    pub fn pending_psbt_hex(&self) -> Res<&str> {
        self.pending_psbt_hex
            .as_deref()
            .ok_or(Error::Protocol(protocol::Error::MissingSessionData("settlement")))
    }

    pub fn set_pending_psbt_hex(&mut self, psbt_hex: String) {
        fill(&mut self.pending_psbt_hex, psbt_hex);
    }

    fn renew_deadline(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }
}

/// A settled trade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapOutcome {
    pub trade_id: TradeId,
    pub role: SwapRole,
    /// Settlement transaction broadcast on-chain.
    pub txid: Txid,
}

/// Human readable reason sent to the counterparty.
fn termination_reason(error: &Error) -> String {
    match error {
        Error::Protocol(e) => e.to_string(),
        Error::Cancelled(reason) => reason.clone(),
        e => e.to_string(),
    }
}

/// Resolves once the deadline elapses or a local termination is requested.
async fn interrupted(deadline: Instant, cancel: &mut watch::Receiver<Option<String>>) -> Error {
    tokio::select! {
        _ = time::sleep_until(deadline) => Error::Timeout,
        reason = cancelled(cancel) => Error::Cancelled(reason),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        let requested = cancel.borrow().clone();
        if let Some(reason) = requested {
            return reason;
        }
        if cancel.changed().await.is_err() {
            // Nobody can cancel anymore
            return future::pending().await;
        }
    }
}

/// One party of a settlement.
pub struct Swap<C> {
    ctx: SwapContext,
    session: SwapSession,
    machine: RoleMachine,
    channel: C,
    own_socket: String,
    remote_socket: String,
}

impl<C> Swap<C>
where
    C: MessageChannel + 'static,
{
    pub fn new(role: SwapRole, ctx: SwapContext, channel: C) -> Self {
        let session = SwapSession::new(role, ctx.config.timeout());
        let own_socket = ctx.intent.party(role).channel_id.clone();
        let remote_socket = ctx.intent.party(role.other()).channel_id.clone();
        Self {
            ctx,
            session,
            machine: RoleMachine::new(role),
            channel,
            own_socket,
            remote_socket,
        }
    }

    pub fn session(&self) -> &SwapSession {
        &self.session
    }

    /// Run the session to completion.
    pub async fn run(self) -> Res<SwapOutcome> {
        let (_cancel, rx) = watch::channel(None);
        self.run_until_cancelled(rx).await
    }

    async fn run_until_cancelled(
        mut self,
        cancel: watch::Receiver<Option<String>>,
    ) -> Res<SwapOutcome> {
        let span = info_span!(
            "swap",
            trade_id = %self.ctx.intent.id(),
            role = %self.session.role,
        );
        async move { self.drive(cancel).await }
            .instrument(span)
            .await
    }

    async fn drive(&mut self, mut cancel: watch::Receiver<Option<String>>) -> Res<SwapOutcome> {
        info!(kind = %self.ctx.intent.kind(), "session started");
        let mut opened = false;
        loop {
            let deadline = self.session.deadline;
            let res = tokio::select! {
                biased;
                err = interrupted(deadline, &mut cancel) => Err(err),
                res = self.step(opened) => res,
            };
            opened = true;
            match res {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(e) => return Err(self.fail(e).await),
            }
        }
    }

    /// Run the next step: the opening payload first, then one inbound event at a time.
    async fn step(&mut self, opened: bool) -> Res<Option<SwapOutcome>> {
        if !opened {
            if let Some(payload) = self.machine.start(&self.ctx, &mut self.session).await? {
                self.emit(payload).await?;
            }
            return Ok(None);
        }
        match self.channel.recv().await {
            Some(event) => self.handle(event).await,
            None => Err(channel::Error::Closed(self.channel.key().to_string()).into()),
        }
    }

    /// Process one inbound event, returns the outcome once settled.
    async fn handle(&mut self, event: SwapEvent) -> Res<Option<SwapOutcome>> {
        if event.socket_id != self.remote_socket {
            return Err(protocol::Error::WrongSocket {
                expected: self.remote_socket.clone(),
                received: event.socket_id,
            }
            .into());
        }
        if !event.is_consistent() {
            return Err(protocol::Error::MalformedPayload(event.event_name).into());
        }
        if let StepPayload::Terminate { reason } = &event.data {
            warn!(%reason, "trade terminated by counterparty");
            self.session.terminated = true;
            self.channel.close().await;
            return Err(Error::Terminated(reason.clone()));
        }

        let expected = match self.machine.expected() {
            Some(tag) => tag,
            None => {
                debug!(step = %event.event_name, "ignoring event after completion");
                return Ok(None);
            }
        };
        if event.event_name != expected {
            let stale = event.event_name.emitter() == Some(self.session.role.other())
                && event.event_name < expected;
            if stale {
                debug!(step = %event.event_name, "ignoring duplicate event");
                return Ok(None);
            }
            return Err(unexpected(expected, &event));
        }

        self.session.current_step = Some(expected);
        info!(step = %expected, "step received");
        match self.machine.advance(&self.ctx, &mut self.session, event).await? {
            Transition::Emit(payload) => {
                self.emit(payload).await?;
                Ok(None)
            }
            Transition::EmitAndComplete(payload, txid) => {
                self.notify(payload).await;
                Ok(Some(self.complete(txid).await))
            }
            Transition::Complete(txid) => Ok(Some(self.complete(txid).await)),
        }
    }

    async fn emit(&mut self, payload: StepPayload) -> Res<()> {
        let tag = payload.tag();
        let event = SwapEvent::new(&self.own_socket, payload);
        self.channel.send(event).await?;
        self.session.current_step = Some(tag);
        if self.ctx.config.renew_deadline_on_progress {
            self.session.renew_deadline(self.ctx.config.timeout());
        }
        info!(step = %tag, "step emitted");
        Ok(())
    }

    /// Send the last payload of a settled trade, the counterparty may already be gone.
    async fn notify(&mut self, payload: StepPayload) {
        let tag = payload.tag();
        match self.channel.send(SwapEvent::new(&self.own_socket, payload)).await {
            Ok(()) => {
                self.session.current_step = Some(tag);
                info!(step = %tag, "step emitted");
            }
            Err(e) => warn!(step = %tag, error = %e, "settled without notifying counterparty"),
        }
    }

    async fn complete(&mut self, txid: Txid) -> SwapOutcome {
        info!(%txid, "trade settled");
        self.channel.close().await;
        SwapOutcome {
            trade_id: self.ctx.intent.id(),
            role: self.session.role,
            txid,
        }
    }

    /// Terminate the trade with the error as reason and hand the error back.
    async fn fail(&mut self, error: Error) -> Error {
        self.terminate(&termination_reason(&error), error.class())
            .await;
        error
    }

    /// Notify the counterparty once, later calls do nothing.
    async fn terminate(&mut self, reason: &str, class: ErrorClass) {
        if self.session.terminated {
            return;
        }
        self.session.terminated = true;
        warn!(%reason, %class, step = ?self.session.current_step, "terminating trade");
        let event = SwapEvent::terminate(&self.own_socket, reason);
        if let Err(e) = self.channel.send(event).await {
            debug!(error = %e, "termination not delivered");
        }
        self.channel.close().await;
    }
}

/// Handle on a session running in its own task.
#[derive(Debug)]
pub struct SessionHandle {
    cancel: watch::Sender<Option<String>>,
    task: JoinHandle<Res<SwapOutcome>>,
}

impl SessionHandle {
    /// Spawn the session on the tokio runtime.
    pub fn spawn<C>(swap: Swap<C>) -> Self
    where
        C: MessageChannel + 'static,
    {
        let (cancel, rx) = watch::channel(None);
        let task = tokio::spawn(swap.run_until_cancelled(rx));
        Self { cancel, task }
    }

    /// Ask the session to terminate with the given reason. Only the first request is kept.
    pub fn terminate(&self, reason: impl Into<String>) {
        if self.cancel.borrow().is_some() {
            return;
        }
        let _ = self.cancel.send(Some(reason.into()));
    }

    /// Wait for the session to settle or terminate.
    pub async fn outcome(self) -> Res<SwapOutcome> {
        self.task
            .await
            .map_err(|e| Error::Cancelled(e.to_string()))?
    }
}
