use crate::fault::RawPeer;
use crate::*;

use tally_core::wire::{Packet, CONTENT_HEADER_LEN};

const SHORT: Duration = Duration::from_millis(150);

/// A gap is dropped without an ack; the missing chunk fills it.
#[tokio::test]
async fn test_gap_is_not_acknowledged() {
    let server = spawn_server(test_config()).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    peer.send_content(1, 3, b"ll").await;
    assert_eq!(peer.recv(SHORT).await, None, "gap must not be acked");

    peer.send_content(0, 3, b"txt:he").await;
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(0));
    peer.send_content(1, 3, b"ll").await;
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(1));
    peer.send_content(2, 3, b"o").await;
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(2));

    let (sequence, total, payload) = peer.recv_content(PATIENCE).await.unwrap();
    assert_eq!((sequence, total), (0, 1));
    assert_eq!(&payload[..], b"hello\r\n\r\n");
    server.shutdown().await.unwrap();
}

/// Duplicates are re-acked; the message is delivered once.
#[tokio::test]
async fn test_duplicate_chunks_deliver_once() {
    let server = spawn_server(test_config()).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    let request = br#"jsn:{"type":"add_currency","currency":"dup"}"#;
    let (head, tail) = request.split_at(10);

    peer.send_content(0, 2, head).await;
    peer.send_content(0, 2, head).await;
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(0));
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(0));

    peer.send_content(1, 2, tail).await;
    // Final chunk repeated as if its ack had been lost.
    peer.send_content(1, 2, tail).await;
    peer.send_content(1, 2, tail).await;

    // Collect everything for a while, acking any response chunk.
    let mut acks = Vec::new();
    let mut replies = Vec::new();
    while let Some(packet) = peer.recv(SHORT).await {
        match packet {
            Packet::Ack { sequence } => acks.push(sequence),
            Packet::Content { sequence, payload, .. } => {
                replies.push(payload);
                peer.send_ack(sequence).await;
            }
            Packet::Nack { .. } => {}
        }
    }

    assert_eq!(acks, vec![1, 1, 1]);
    assert!(!replies.is_empty());
    for reply in &replies {
        assert_eq!(&reply[..], b"txt:Currency dup added", "delivered twice?");
    }
    server.shutdown().await.unwrap();
}

/// T = 3 with the ack for chunk 1 lost: the sweep resends 1 and 2, never 0.
#[tokio::test]
async fn test_lost_ack_resends_from_cursor() {
    let mut config = test_config();
    // 4-byte chunks: "abcdefgh\r\n\r\n" is 3 chunks.
    config.network.mtu = CONTENT_HEADER_LEN + 4;
    config.protocol.retransmit_after_ticks = 10;
    let server = spawn_server(config).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    peer.send_message(b"txt:abcdefgh", 64).await;
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(0));

    let mut first = Vec::new();
    for _ in 0..3 {
        let (sequence, total, _) = peer.recv_content(PATIENCE).await.unwrap();
        assert_eq!(total, 3);
        first.push(sequence);
    }
    assert_eq!(first, vec![0, 1, 2]);

    peer.send_ack(0).await;
    // ack 1 "lost"; ack 2 is ahead of the cursor and ignored
    peer.send_ack(2).await;

    let (resent, _, _) = peer.recv_content(PATIENCE).await.unwrap();
    assert_eq!(resent, 1);
    let (resent, _, payload) = peer.recv_content(PATIENCE).await.unwrap();
    assert_eq!(resent, 2);
    assert_eq!(&payload[..], b"\r\n\r\n");

    peer.send_ack(1).await;
    peer.send_ack(2).await;

    // Drain retransmissions already in flight, then expect silence.
    tokio::time::sleep(SHORT).await;
    while peer.recv(Duration::from_millis(1)).await.is_some() {}
    assert_eq!(peer.recv(SHORT).await, None, "complete response must not be resent");
    server.shutdown().await.unwrap();
}

/// Responses to back-to-back requests arrive in order, one at a time.
#[tokio::test]
async fn test_responses_are_serialized_per_session() {
    let mut config = test_config();
    // Keep the first response quiet while the second request is in flight.
    config.protocol.retransmit_after_ticks = 50;
    let server = spawn_server(config).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    peer.send_content(0, 1, b"txt:first").await;
    let (_, _, one) = peer.recv_content(PATIENCE).await.unwrap();
    assert_eq!(&one[..], b"first\r\n\r\n");

    // Second request before acking the first response.
    peer.send_content(0, 1, b"txt:second").await;
    while let Some((_, _, payload)) = peer.recv_content(SHORT).await {
        assert_eq!(&payload[..], b"first\r\n\r\n", "second reply overtook the first");
    }

    peer.send_ack(0).await;
    let (_, _, two) = peer.recv_content(PATIENCE).await.unwrap();
    assert_eq!(&two[..], b"second\r\n\r\n");
    peer.send_ack(0).await;
    server.shutdown().await.unwrap();
}

/// Nacks are not a recovery trigger: nothing is resent and the ack cursor
/// stays where it was.
#[tokio::test]
async fn test_nack_is_ignored() {
    let mut config = test_config();
    config.protocol.retransmit_after_ticks = 50;
    let server = spawn_server(config).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    peer.send_content(0, 1, b"txt:quiet").await;
    let (_, _, reply) = peer.recv_content(PATIENCE).await.unwrap();
    assert_eq!(&reply[..], b"quiet\r\n\r\n");

    peer.send_nack(0).await;
    peer.send_nack(0).await;
    assert_eq!(peer.recv(SHORT).await, None, "nack must not trigger a resend");

    let handle = server.registry().get(&peer.addr()).unwrap();
    assert_eq!(handle.lock().await.pending_responses(), 1);

    peer.send_ack(0).await;
    let registry = server.registry().clone();
    let me = peer.addr();
    assert!(
        wait_until(|| registry
            .get(&me)
            .and_then(|h| h.try_lock().ok().map(|s| s.pending_responses() == 0))
            .unwrap_or(false))
        .await
    );
    server.shutdown().await.unwrap();
}

/// Without message ids a byte-identical request, sent while the reply to
/// the previous one is still unacknowledged, is indistinguishable from a
/// retransmission of that request. It is re-acked and not applied again.
#[tokio::test]
async fn test_identical_request_before_reply_ack_is_collapsed() {
    let mut config = test_config();
    config.protocol.idle_timeout_ticks = 1000;
    config.protocol.retransmit_after_ticks = 50;
    let server = spawn_server(config).await;
    let peer = RawPeer::connect(server.local_addr()).await;

    let add = br#"jsn:{"type":"add_currency","currency":"usd"}"#;
    assert_eq!(
        &peer.exchange(add, PATIENCE).await.unwrap()[..],
        b"txt:Currency usd added"
    );

    let value = br#"jsn:{"type":"add_currency_value","currency":"usd","value":1.0}"#;
    peer.send_content(0, 1, value).await;
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(0));
    assert!(peer.recv_content(PATIENCE).await.is_some());

    // Reply not acked; the same bytes again.
    peer.send_content(0, 1, value).await;
    assert_eq!(peer.recv_ack(PATIENCE).await, Some(0));
    peer.send_ack(0).await;
    assert_eq!(peer.recv_content(SHORT).await, None, "no second reply");

    let mut c = client(server.local_addr()).await;
    let reply = c
        .request(r#"jsn:{"type":"get_currency_history","currency":"usd"}"#)
        .await
        .unwrap();
    let doc: serde_json::Value = serde_json::from_str(reply.strip_prefix("jsn:").unwrap()).unwrap();
    assert_eq!(doc["history"].as_array().unwrap().len(), 1);
    server.shutdown().await.unwrap();
}

/// A queued reply only takes acks after it has been resent once, so a late
/// duplicate ack for the reply before it cannot complete it.
#[tokio::test]
async fn test_late_ack_does_not_complete_queued_reply() {
    let mut config = test_config();
    config.protocol.idle_timeout_ticks = 1000;
    config.protocol.retransmit_after_ticks = 5;
    config.protocol.retry_budget = 20;
    let server = spawn_server(config).await;
    let peer = RawPeer::connect(server.local_addr()).await;
    let me = peer.addr();

    peer.send_content(0, 1, b"txt:first").await;
    let (_, _, one) = peer.recv_content(PATIENCE).await.unwrap();
    assert_eq!(&one[..], b"first\r\n\r\n");

    peer.send_content(0, 1, b"txt:second").await;
    let registry = server.registry().clone();
    assert!(
        wait_until(|| registry
            .get(&me)
            .and_then(|h| h.try_lock().ok().map(|s| s.pending_responses() == 2))
            .unwrap_or(false))
        .await,
        "second reply should queue behind the first"
    );

    peer.send_ack(0).await;
    // First transmission of "second" is lost.
    loop {
        let (_, _, payload) = peer.recv_content(PATIENCE).await.unwrap();
        if &payload[..] == b"second\r\n\r\n" {
            break;
        }
    }
    // Duplicate ack for "first".
    peer.send_ack(0).await;

    let (sequence, _, resent) = peer.recv_content(PATIENCE).await.expect("second resent");
    assert_eq!(sequence, 0);
    assert_eq!(&resent[..], b"second\r\n\r\n");

    peer.send_ack(0).await;
    assert!(
        wait_until(|| registry
            .get(&me)
            .and_then(|h| h.try_lock().ok().map(|s| s.pending_responses() == 0))
            .unwrap_or(false))
        .await
    );
    server.shutdown().await.unwrap();
}
