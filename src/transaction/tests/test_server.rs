use super::*;
use crate::transaction::server::ServerState;
use crate::Error;
use rsip::transport::Transport;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::timeout;

const BRANCH: &str = "z9hG4bKuasinv1";

async fn incoming_tx(
    incoming: &mut crate::transaction::endpoint::TransactionReceiver,
) -> crate::transaction::ServerTransaction {
    timeout(Duration::from_secs(2), incoming.recv())
        .await
        .expect("timed out waiting for server transaction")
        .expect("incoming channel closed")
}

#[tokio::test]
async fn test_non_invite_server_over_tcp() {
    let mut env = TestEnv::new(Transport::Tcp).await;
    let mut incoming = env.endpoint.incoming_transactions().unwrap();

    env.peer_tx
        .send(request(rsip::Method::Options, BRANCH, 5).into())
        .unwrap();
    let tx = incoming_tx(&mut incoming).await;
    assert_eq!(tx.state().await, ServerState::Trying);

    let ok = env
        .endpoint
        .inner
        .make_response(tx.original(), rsip::StatusCode::OK, None);
    tx.respond(ok).await.unwrap();
    env.expect_wire(|m| is_status(m, 200)).await;

    // Timer J is zero on reliable transport: done fires right away.
    timeout(Duration::from_secs(1), tx.done())
        .await
        .expect("transaction should terminate");
    assert!(env.endpoint.inner.server_transactions.is_empty());
}

#[tokio::test]
async fn test_invite_server_auto_trying() {
    let mut env = TestEnv::new(Transport::Udp).await;
    let mut incoming = env.endpoint.incoming_transactions().unwrap();

    env.peer_tx
        .send(request(rsip::Method::Invite, BRANCH, 1).into())
        .unwrap();
    let tx = incoming_tx(&mut incoming).await;
    assert_eq!(tx.state().await, ServerState::Proceeding);

    // Nobody answers, so the 100 Trying goes out by itself.
    env.expect_wire(|m| is_status(m, 100)).await;

    let ringing = env
        .endpoint
        .inner
        .make_response(tx.original(), rsip::StatusCode::Ringing, None);
    tx.respond(ringing).await.unwrap();
    env.expect_wire(|m| is_status(m, 180)).await;
    assert_eq!(tx.state().await, ServerState::Proceeding);

    tx.terminate().await;
}

#[tokio::test]
async fn test_invite_server_retransmit_absorption() {
    let mut env = TestEnv::new(Transport::Udp).await;
    let mut incoming = env.endpoint.incoming_transactions().unwrap();

    let invite = request(rsip::Method::Invite, BRANCH, 1);
    env.peer_tx.send(invite.clone().into()).unwrap();
    env.peer_tx.send(invite.clone().into()).unwrap();

    // Two identical INVITEs, one transaction, one entry.
    let tx = incoming_tx(&mut incoming).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(incoming.try_recv().is_err());
    assert_eq!(env.endpoint.inner.server_transactions.len(), 1);

    // Once a response exists, a further retransmit replays it.
    let ringing = env
        .endpoint
        .inner
        .make_response(tx.original(), rsip::StatusCode::Ringing, None);
    tx.respond(ringing).await.unwrap();
    env.expect_wire(|m| is_status(m, 180)).await;
    env.peer_tx.send(invite.into()).unwrap();
    env.expect_wire(|m| is_status(m, 180)).await;

    tx.terminate().await;
    timeout(Duration::from_secs(1), tx.done()).await.unwrap();
    assert!(env.endpoint.inner.server_transactions.is_empty());
}

#[tokio::test]
async fn test_invite_server_cancel_produces_487() {
    let mut env = TestEnv::new(Transport::Udp).await;
    let mut incoming = env.endpoint.incoming_transactions().unwrap();

    let invite = request(rsip::Method::Invite, BRANCH, 1);
    env.peer_tx.send(invite.clone().into()).unwrap();
    let tx = incoming_tx(&mut incoming).await;
    let mut acks = tx.acks().expect("acks");

    let canceled = Arc::new(AtomicUsize::new(0));
    {
        let canceled = canceled.clone();
        assert!(tx.on_cancel(move |_| {
            canceled.fetch_add(1, Ordering::SeqCst);
        }));
    }

    env.peer_tx.send(cancel_for(&invite, 1).into()).unwrap();

    // The transaction answers the INVITE with 487 and the endpoint
    // answers the CANCEL with 200.
    env.expect_wire(|m| is_status(m, 487)).await;
    env.expect_wire(|m| is_status(m, 200)).await;
    assert_eq!(canceled.load(Ordering::SeqCst), 1);
    assert_eq!(tx.state().await, ServerState::Completed);
    assert!(matches!(tx.err(), Some(Error::TransactionCanceled(_))));

    // Late registration is refused.
    assert!(!tx.on_cancel(|_| {}));

    // The ACK moves the transaction to Confirmed and is surfaced.
    env.peer_tx.send(ack_for(&invite, 1).into()).unwrap();
    let ack = timeout(Duration::from_secs(2), acks.recv())
        .await
        .expect("timed out waiting for ack")
        .expect("ack channel closed");
    assert_eq!(ack.method, rsip::Method::Ack);
    assert_eq!(tx.state().await, ServerState::Confirmed);

    // Timer I drains the confirmed state.
    timeout(Duration::from_secs(2), tx.done())
        .await
        .expect("transaction should terminate");
    assert!(env.endpoint.inner.server_transactions.is_empty());
}

#[tokio::test]
async fn test_invite_server_timer_g_retransmits_until_h() {
    let mut env = TestEnv::new(Transport::Udp).await;
    let mut incoming = env.endpoint.incoming_transactions().unwrap();

    env.peer_tx
        .send(request(rsip::Method::Invite, BRANCH, 1).into())
        .unwrap();
    let tx = incoming_tx(&mut incoming).await;

    let busy = env
        .endpoint
        .inner
        .make_response(tx.original(), rsip::StatusCode::BusyHere, None);
    tx.respond(busy).await.unwrap();
    env.expect_wire(|m| is_status(m, 486)).await;

    // Timer G keeps replaying the final while no ACK shows up.
    let retransmits = env
        .count_wire(Duration::from_millis(300), |m| is_status(m, 486))
        .await;
    assert!(retransmits >= 2, "expected retransmissions, saw {}", retransmits);

    // Timer H gives up on the ACK.
    timeout(Duration::from_secs(2), tx.done())
        .await
        .expect("transaction should terminate");
    assert!(matches!(tx.err(), Some(Error::TransactionTimeout(_))));
    assert!(env.endpoint.inner.server_transactions.is_empty());
}

#[tokio::test]
async fn test_invite_server_accepted_state() {
    let mut env = TestEnv::new(Transport::Udp).await;
    let mut incoming = env.endpoint.incoming_transactions().unwrap();

    let invite = request(rsip::Method::Invite, BRANCH, 1);
    env.peer_tx.send(invite.clone().into()).unwrap();
    let tx = incoming_tx(&mut incoming).await;
    let mut acks = tx.acks().expect("acks");

    let ok = env
        .endpoint
        .inner
        .make_response(tx.original(), rsip::StatusCode::OK, None);
    tx.respond(ok.clone()).await.unwrap();
    env.expect_wire(|m| is_status(m, 200)).await;
    assert_eq!(tx.state().await, ServerState::Accepted);

    // The TU retransmits its 2xx through the transaction.
    tx.respond(ok).await.unwrap();
    env.expect_wire(|m| is_status(m, 200)).await;

    // A 2xx ACK is surfaced for the dialog layer; the state stays.
    env.peer_tx.send(ack_for(&invite, 1).into()).unwrap();
    timeout(Duration::from_secs(2), acks.recv())
        .await
        .expect("timed out waiting for ack")
        .expect("ack channel closed");
    assert_eq!(tx.state().await, ServerState::Accepted);

    // Timer L drains the accepted state.
    timeout(Duration::from_secs(2), tx.done())
        .await
        .expect("transaction should terminate");
    assert!(matches!(tx.err(), Some(Error::TransactionTerminated(_))));
}

#[tokio::test]
async fn test_respond_after_terminate_returns_stored_error() {
    let mut env = TestEnv::new(Transport::Udp).await;
    let mut incoming = env.endpoint.incoming_transactions().unwrap();

    env.peer_tx
        .send(request(rsip::Method::Options, BRANCH, 2).into())
        .unwrap();
    let tx = incoming_tx(&mut incoming).await;
    tx.terminate().await;

    let ok = env
        .endpoint
        .inner
        .make_response(tx.original(), rsip::StatusCode::OK, None);
    let err = tx.respond(ok).await.expect_err("respond must fail");
    assert!(matches!(err, Error::TransactionTerminated(_)));

    // Nothing went out.
    let writes = env.count_wire(Duration::from_millis(50), |_| true).await;
    assert_eq!(writes, 0);
}
