use std::time::Duration;

use tokio::time::Instant;
use tradelayer_swap::blockchain::Network;
use tradelayer_swap::channel::{duplex, MessageChannel};
use tradelayer_swap::config::SwapConfig;
use tradelayer_swap::escrow;
use tradelayer_swap::protocol::{self, StepPayload, StepTag, SwapEvent};
use tradelayer_swap::role::SwapRole;
use tradelayer_swap::session::{SessionHandle, Swap};
use tradelayer_swap::swap::SwapContext;
use tradelayer_swap::Error;

mod common;
use common::*;

#[tokio::test(start_paused = true)]
async fn silent_counterparty_times_out() {
    init_tracing();
    let chain = Chain::new();
    let intent = utxo_trade();
    let (seller_end, mut remote) = duplex(SELLER_SOCKET, BUYER_SOCKET);
    let swap = Swap::new(
        SwapRole::Seller,
        context(&intent, Node::new(chain.clone())),
        seller_end,
    );

    let started = Instant::now();
    let res = swap.run().await;
    assert!(matches!(res, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(61));

    assert_eq!(
        remote.recv().await.unwrap().event_name,
        StepTag::SellerStep1
    );
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::terminate(SELLER_SOCKET, "timeout")
    );
    assert!(remote.recv().await.is_none());
    assert!(chain.broadcasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn buyer_times_out_when_seller_stops_after_ack() {
    init_tracing();
    let chain = Chain::new();
    let intent = utxo_trade();
    let (buyer_end, mut remote) = duplex(BUYER_SOCKET, SELLER_SOCKET);
    let started = Instant::now();
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Buyer,
        context(&intent, Node::new(chain.clone())),
        buyer_end,
    ));

    let escrow = escrow::derive_for_trade(Network::Testnet, &intent).unwrap();
    remote
        .send(SwapEvent::new(SELLER_SOCKET, StepPayload::Escrow(escrow)))
        .await
        .unwrap();
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::new(BUYER_SOCKET, StepPayload::Ack)
    );

    assert!(matches!(handle.outcome().await, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(61));
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::terminate(BUYER_SOCKET, "timeout")
    );
    assert!(remote.recv().await.is_none());
    assert!(chain.broadcasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_wallet_times_out_before_the_escrow_is_proposed() {
    init_tracing();
    let chain = Chain::new();
    let intent = utxo_trade();
    let (seller_end, mut remote) = duplex(SELLER_SOCKET, BUYER_SOCKET);
    let swap = Swap::new(
        SwapRole::Seller,
        context(&intent, Node::stalling(chain.clone(), Duration::from_secs(3600))),
        seller_end,
    );

    let started = Instant::now();
    assert!(matches!(swap.run().await, Err(Error::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(61));
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::terminate(SELLER_SOCKET, "timeout")
    );
    assert!(remote.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn stalled_wallet_times_out_while_handling_a_step() {
    init_tracing();
    let intent = utxo_trade();
    let (buyer_end, mut remote) = duplex(BUYER_SOCKET, SELLER_SOCKET);
    let started = Instant::now();
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Buyer,
        context(&intent, Node::stalling(Chain::new(), Duration::from_secs(3600))),
        buyer_end,
    ));

    let escrow = escrow::derive_for_trade(Network::Testnet, &intent).unwrap();
    remote
        .send(SwapEvent::new(SELLER_SOCKET, StepPayload::Escrow(escrow)))
        .await
        .unwrap();

    assert!(matches!(handle.outcome().await, Err(Error::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(61));
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::terminate(BUYER_SOCKET, "timeout")
    );
}

#[tokio::test(start_paused = true)]
async fn local_termination_interrupts_a_stalled_step() {
    init_tracing();
    let intent = utxo_trade();
    let (seller_end, mut remote) = duplex(SELLER_SOCKET, BUYER_SOCKET);
    let started = Instant::now();
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Seller,
        context(&intent, Node::stalling(Chain::new(), Duration::from_secs(3600))),
        seller_end,
    ));

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.terminate("user abort");
    assert!(matches!(
        handle.outcome().await,
        Err(Error::Cancelled(reason)) if reason == "user abort"
    ));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::terminate(SELLER_SOCKET, "user abort")
    );
}

#[tokio::test(start_paused = true)]
async fn progress_renews_the_deadline() {
    init_tracing();
    let chain = Chain::new();
    let intent = utxo_trade();
    let node = Node::new(chain.clone());
    let config = SwapConfig {
        renew_deadline_on_progress: true,
        ..SwapConfig::default()
    };
    let ctx = SwapContext::new(intent, config, node.clone(), node);
    let (seller_end, mut remote) = duplex(SELLER_SOCKET, BUYER_SOCKET);

    let started = Instant::now();
    let handle = SessionHandle::spawn(Swap::new(SwapRole::Seller, ctx, seller_end));
    assert_eq!(
        remote.recv().await.unwrap().event_name,
        StepTag::SellerStep1
    );
    tokio::time::sleep(Duration::from_secs(50)).await;
    remote
        .send(SwapEvent::new(BUYER_SOCKET, StepPayload::Ack))
        .await
        .unwrap();
    assert_eq!(
        remote.recv().await.unwrap().event_name,
        StepTag::SellerStep3
    );

    assert!(matches!(handle.outcome().await, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_secs(110));
    assert_eq!(chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn forged_escrow_terminates() {
    init_tracing();
    let intent = utxo_trade();
    let (buyer_end, mut remote) = duplex(BUYER_SOCKET, SELLER_SOCKET);
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Buyer,
        context(&intent, Node::new(Chain::new())),
        buyer_end,
    ));

    // Same keys in the wrong order
    let [first, second] = escrow::ordered_keys(&intent);
    let forged = escrow::derive_escrow(Network::Testnet, &second, &first).unwrap();
    remote
        .send(SwapEvent::new(SELLER_SOCKET, StepPayload::Escrow(forged)))
        .await
        .unwrap();

    assert!(matches!(
        handle.outcome().await,
        Err(Error::Protocol(protocol::Error::EscrowMismatch))
    ));
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::terminate(BUYER_SOCKET, "escrow mismatch")
    );
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn duplicates_are_ignored_and_skipped_steps_rejected() {
    init_tracing();
    let intent = utxo_trade();
    let (buyer_end, mut remote) = duplex(BUYER_SOCKET, SELLER_SOCKET);
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Buyer,
        context(&intent, Node::new(Chain::new())),
        buyer_end,
    ));

    let escrow = escrow::derive_for_trade(Network::Testnet, &intent).unwrap();
    let proposal = SwapEvent::new(SELLER_SOCKET, StepPayload::Escrow(escrow));
    remote.send(proposal.clone()).await.unwrap();
    assert_eq!(
        remote.recv().await.unwrap(),
        SwapEvent::new(BUYER_SOCKET, StepPayload::Ack)
    );

    remote.send(proposal).await.unwrap();
    remote
        .send(SwapEvent::new(
            SELLER_SOCKET,
            StepPayload::CosignedPsbt {
                psbt_hex: "00".to_string(),
                final_txid: None,
            },
        ))
        .await
        .unwrap();

    assert!(matches!(
        handle.outcome().await,
        Err(Error::Protocol(protocol::Error::UnexpectedStep {
            expected: StepTag::SellerStep3,
            received: StepTag::SellerStep5,
        }))
    ));
    // No second acknowledgement before the termination
    assert_eq!(
        remote.recv().await.unwrap().event_name,
        StepTag::TerminateTrade
    );
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn event_from_unknown_socket_terminates() {
    init_tracing();
    let intent = utxo_trade();
    let (buyer_end, mut remote) = duplex(BUYER_SOCKET, SELLER_SOCKET);
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Buyer,
        context(&intent, Node::new(Chain::new())),
        buyer_end,
    ));

    let escrow = escrow::derive_for_trade(Network::Testnet, &intent).unwrap();
    remote
        .send(SwapEvent::new("intruder", StepPayload::Escrow(escrow)))
        .await
        .unwrap();

    assert!(matches!(
        handle.outcome().await,
        Err(Error::Protocol(protocol::Error::WrongSocket { received, .. })) if received == "intruder"
    ));
    assert_eq!(
        remote.recv().await.unwrap().event_name,
        StepTag::TerminateTrade
    );
}

#[tokio::test]
async fn counterparty_termination_is_not_echoed() {
    init_tracing();
    let intent = utxo_trade();
    let (buyer_end, mut remote) = duplex(BUYER_SOCKET, SELLER_SOCKET);
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Buyer,
        context(&intent, Node::new(Chain::new())),
        buyer_end,
    ));

    remote
        .send(SwapEvent::terminate(SELLER_SOCKET, "order cancelled"))
        .await
        .unwrap();

    assert!(matches!(
        handle.outcome().await,
        Err(Error::Terminated(reason)) if reason == "order cancelled"
    ));
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn local_termination_is_sent_once() {
    init_tracing();
    let chain = Chain::new();
    let intent = channel_trade();
    let (seller_end, mut remote) = duplex(SELLER_SOCKET, BUYER_SOCKET);
    let handle = SessionHandle::spawn(Swap::new(
        SwapRole::Seller,
        context(&intent, Node::new(chain.clone())),
        seller_end,
    ));

    handle.terminate("user abort");
    handle.terminate("second request");
    assert!(matches!(
        handle.outcome().await,
        Err(Error::Cancelled(reason)) if reason == "user abort"
    ));

    let mut terminations = vec![];
    while let Some(event) = remote.recv().await {
        if let StepPayload::Terminate { reason } = event.data {
            terminations.push(reason);
        }
    }
    assert_eq!(terminations, vec!["user abort".to_string()]);
    assert!(chain.broadcasts().is_empty());
}
