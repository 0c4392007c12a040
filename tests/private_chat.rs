//! Integration tests for private chat: the rendezvous over a short-lived
//! direct connection, end-to-end encrypted delivery through intermediate
//! nodes, and the failure paths.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use ringchat::{ChatEvent, Keypair, Node, NodeConfig};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(40100);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(port: u16) -> NodeConfig {
    NodeConfig {
        port,
        stabilize_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_millis(800),
        successor_list_size: 2,
    }
}

async fn bind_node() -> Node {
    Node::bind(test_config(next_port()))
        .await
        .expect("bind failed")
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Build a converged ring a -> b -> c -> a.
async fn three_ring() -> (Node, Node, Node) {
    let a = bind_node().await;
    let b = bind_node().await;
    let c = bind_node().await;

    b.join(&a.addr()).await.expect("b join failed");
    wait_for("two-node ring", || {
        a.successor_addr() == Some(b.addr()) && b.successor_addr() == Some(a.addr())
    })
    .await;
    c.join(&a.addr()).await.expect("c join failed");
    wait_for("three-node ring", || {
        a.successor_addr() == Some(b.addr())
            && b.successor_addr() == Some(c.addr())
            && c.successor_addr() == Some(a.addr())
    })
    .await;

    (a, b, c)
}

#[tokio::test]
async fn rendezvous_delivers_a_private_message_across_the_ring() {
    let (a, b, c) = three_ring().await;
    let mut events_c = c.events().expect("events receiver");

    // The request hops a -> b -> c; c then dials a directly and both ends
    // keep the fresh session's suite.
    a.start_private_chat(&c.public_key())
        .await
        .expect("start_private_chat failed");

    wait_for("both endpoints to hold a private session", || {
        a.has_private_session(&c.public_key()) && c.has_private_session(&a.public_key())
    })
    .await;

    // The intermediate node never takes part in the rendezvous.
    assert!(!b.has_private_session(&a.public_key()));
    assert!(!b.has_private_session(&c.public_key()));

    a.private_chat(&c.public_key(), "secret")
        .await
        .expect("private_chat failed");

    let (from, text) = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events_c.recv().await {
                Some(ChatEvent::Private { from, text }) => break (from, text),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for the private chat");

    assert_eq!(from, a.public_key());
    assert_eq!(text, "secret");

    // Private traffic never lands in the public logs.
    assert!(b.chat_log().is_empty());
    assert!(c.chat_log().is_empty());

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn private_chat_requires_a_rendezvous_first() {
    let a = bind_node().await;
    let b = bind_node().await;

    b.join(&a.addr()).await.expect("join failed");
    wait_for("two-node ring", || {
        a.successor_addr() == Some(b.addr()) && b.successor_addr() == Some(a.addr())
    })
    .await;

    let err = a
        .private_chat(&b.public_key(), "too soon")
        .await
        .expect_err("sending without a session must fail");
    assert!(
        err.to_string().contains("not been initialized"),
        "unexpected error: {err:#}"
    );

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn request_for_an_absent_identity_stops_at_the_originator() {
    let a = bind_node().await;
    let b = bind_node().await;

    b.join(&a.addr()).await.expect("join failed");
    wait_for("two-node ring", || {
        a.successor_addr() == Some(b.addr()) && b.successor_addr() == Some(a.addr())
    })
    .await;

    // Nobody on the ring owns this key; the request circles once and dies.
    let stranger = Keypair::generate().identity();
    a.start_private_chat(&stranger)
        .await
        .expect("sending the request must succeed");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!a.has_private_session(&stranger));
    assert!(!b.has_private_session(&stranger));

    // The ring is still healthy afterwards.
    a.chat("still alive").await.expect("chat failed");
    wait_for("chat to reach b", || {
        b.chat_log().iter().any(|e| e.text == "still alive")
    })
    .await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn lone_node_cannot_start_a_private_chat() {
    let a = bind_node().await;

    let target = Keypair::generate().identity();
    assert!(a.start_private_chat(&target).await.is_err());
    assert!(a.private_chat(&target, "nope").await.is_err());

    a.close().await;
}
