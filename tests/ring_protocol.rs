//! Integration tests for ring membership: join, stabilization, broadcast,
//! chat log replication, and successor failover.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use ringchat::{Node, NodeConfig};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(30100);

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

/// Poll until `condition` holds; panic after a generous deadline.
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

#[tokio::test]
async fn two_node_ring_converges() {
    let a = bind_node().await;
    let b = bind_node().await;

    b.join(&a.addr()).await.expect("join failed");

    wait_for("two-node ring to form", || {
        a.successor_addr() == Some(b.addr())
            && b.successor_addr() == Some(a.addr())
            && a.predecessor() == b.addr()
            && b.predecessor() == a.addr()
    })
    .await;

    a.chat("hello").await.expect("chat failed");

    wait_for("chat to reach b", || {
        b.chat_log()
            .iter()
            .any(|entry| entry.public_key == a.public_key() && entry.text == "hello")
    })
    .await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn third_join_heals_into_a_three_ring() {
    let a = bind_node().await;
    let b = bind_node().await;
    let c = bind_node().await;

    b.join(&a.addr()).await.expect("b join failed");
    wait_for("initial two-node ring", || {
        a.successor_addr() == Some(b.addr()) && b.successor_addr() == Some(a.addr())
    })
    .await;

    c.join(&a.addr()).await.expect("c join failed");

    // C inserts itself as A's predecessor; B discovers it through the
    // stabilize step and re-joins through C.
    wait_for("three-node ring to converge", || {
        a.successor_addr() == Some(b.addr())
            && b.successor_addr() == Some(c.addr())
            && c.successor_addr() == Some(a.addr())
            && a.predecessor() == c.addr()
            && b.predecessor() == a.addr()
            && c.predecessor() == b.addr()
    })
    .await;

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn broadcast_visits_every_node_exactly_once() {
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
        b.successor_addr() == Some(c.addr()) && c.successor_addr() == Some(a.addr())
    })
    .await;

    a.chat("ring message").await.expect("chat failed");

    let count = |node: &Node| {
        node.chat_log()
            .iter()
            .filter(|entry| {
                entry.public_key == a.public_key() && entry.text == "ring message"
            })
            .count()
    };

    wait_for("broadcast to reach every node", || {
        count(&a) >= 1 && count(&b) >= 1 && count(&c) >= 1
    })
    .await;

    // Give any stray duplicate time to show up, then insist on exactly once.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count(&a), 1, "originator log");
    assert_eq!(count(&b), 1, "first hop log");
    assert_eq!(count(&c), 1, "second hop log");

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn joining_node_bootstraps_the_chat_log() {
    let a = bind_node().await;
    let b = bind_node().await;

    b.join(&a.addr()).await.expect("b join failed");
    wait_for("two-node ring", || {
        a.successor_addr() == Some(b.addr()) && b.successor_addr() == Some(a.addr())
    })
    .await;

    a.chat("before c existed").await.expect("chat failed");
    wait_for("history to replicate to b", || {
        b.chat_log().iter().any(|e| e.text == "before c existed")
    })
    .await;

    // A node with an empty log requests the full history on join.
    let c = bind_node().await;
    c.join(&a.addr()).await.expect("c join failed");

    wait_for("c to receive the chat history", || {
        c.chat_log()
            .iter()
            .any(|entry| entry.public_key == a.public_key() && entry.text == "before c existed")
    })
    .await;

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn ping_timeout_fails_over_to_the_successor_list() {
    let a = bind_node().await;
    let b = bind_node().await;
    let c = bind_node().await;
    let d = bind_node().await;

    b.join(&a.addr()).await.expect("b join failed");
    wait_for("two-node ring", || {
        a.successor_addr() == Some(b.addr()) && b.successor_addr() == Some(a.addr())
    })
    .await;
    c.join(&a.addr()).await.expect("c join failed");
    wait_for("three-node ring", || {
        b.successor_addr() == Some(c.addr()) && c.successor_addr() == Some(a.addr())
    })
    .await;
    d.join(&a.addr()).await.expect("d join failed");
    wait_for("four-node ring", || {
        a.successor_addr() == Some(b.addr())
            && b.successor_addr() == Some(c.addr())
            && c.successor_addr() == Some(d.addr())
            && d.successor_addr() == Some(a.addr())
    })
    .await;

    // Failover needs the list of successors behind B.
    wait_for("a's successor list to fill", || {
        a.successor_list() == vec![c.addr(), d.addr()]
    })
    .await;

    b.close().await;

    wait_for("a to fail over to c", || {
        a.successor_addr() == Some(c.addr())
    })
    .await;

    wait_for("ring to heal around the dead node", || {
        a.successor_addr() == Some(c.addr())
            && c.successor_addr() == Some(d.addr())
            && d.successor_addr() == Some(a.addr())
            && c.predecessor() == a.addr()
    })
    .await;

    a.close().await;
    c.close().await;
    d.close().await;
}

#[tokio::test]
async fn five_sequential_joins_converge_to_one_ring() {
    let nodes = vec![
        bind_node().await,
        bind_node().await,
        bind_node().await,
        bind_node().await,
        bind_node().await,
    ];

    // Everyone joins through the first node; stabilization has to untangle
    // the resulting star into a ring.
    for node in &nodes[1..] {
        node.join(&nodes[0].addr()).await.expect("join failed");
    }

    // Converged means: every successor pointer resolves to another member,
    // that member points back with its predecessor, and following successor
    // pointers walks the whole membership.
    wait_for("five nodes to converge into one ring", || {
        let addr_of = |addr: &str| nodes.iter().find(|n| n.addr() == addr);

        let mut seen = std::collections::HashSet::new();
        let mut current = &nodes[0];
        for _ in 0..nodes.len() {
            let Some(successor_addr) = current.successor_addr() else {
                return false;
            };
            let Some(successor) = addr_of(&successor_addr) else {
                return false;
            };
            if successor.predecessor() != current.addr() {
                return false;
            }
            if !seen.insert(successor_addr) {
                return false;
            }
            current = successor;
        }
        seen.len() == nodes.len() && current.addr() == nodes[0].addr()
    })
    .await;

    for node in &nodes {
        node.close().await;
    }
}

#[tokio::test]
async fn lone_node_has_no_route_for_chat() {
    let a = bind_node().await;

    assert_eq!(a.successor_addr(), None);
    assert_eq!(a.predecessor(), a.addr(), "a lone node is its own predecessor");
    assert!(a.chat("shouting into the void").await.is_err());

    a.close().await;
}
