//! Integration Tests
//!
//! End-to-end coverage of a single node: the full apply pipeline from
//! submit to query, dedup, ordering, and the HTTP surface.

mod common;

use pretty_assertions::assert_eq;
use relaymq::{ApiServer, Message, Node, NodeConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn await_leadership(node: &Arc<Node>) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !node.raft().is_leader() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("single node never elected itself");
}

async fn await_applied(node: &Arc<Node>, seq: u64) {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let page = node.query_messages(0, Some(1000), None, None).unwrap();
            if page.messages.iter().any(|m| m.seq == seq) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("entry never became queryable");
}

fn single_node_config(temp: &TempDir) -> NodeConfig {
    NodeConfig {
        node_id: "solo".into(),
        data_dir: temp.path().to_path_buf(),
        hold_back: Duration::from_millis(200),
        ..Default::default()
    }
}

// ============================================================================
// Single-node pipeline
// ============================================================================

mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_submit_commit_apply_query() {
        let temp = TempDir::new().unwrap();
        let node = Node::new(single_node_config(&temp)).unwrap();
        node.start();
        await_leadership(&node).await;

        let receipt = node
            .submit(Message::new("hello").with_msg_id("a").with_sender("alice"))
            .await
            .unwrap();
        assert_eq!(receipt.seq, 1);
        assert_eq!(receipt.msg_id, "a");

        await_applied(&node, 1).await;
        let page = node.query_messages(0, None, None, None).unwrap();
        assert_eq!(page.messages.len(), 1);
        let msg = &page.messages[0];
        assert_eq!(msg.seq, 1);
        assert_eq!(msg.payload, "hello");
        assert_eq!(msg.sender.as_deref(), Some("alice"));
        assert!(msg.corrected_ts.is_some());
        assert!(page.next_after.is_none());

        node.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_msg_id_commits_once() {
        let temp = TempDir::new().unwrap();
        let node = Node::new(single_node_config(&temp)).unwrap();
        node.start();
        await_leadership(&node).await;

        let first = node
            .submit(Message::new("one").with_msg_id("dup"))
            .await
            .unwrap();
        await_applied(&node, first.seq).await;

        let second = node
            .submit(Message::new("two").with_msg_id("dup"))
            .await
            .unwrap();
        assert_eq!(second.seq, first.seq);
        assert!(second.duplicate);

        let page = node.query_messages(0, None, None, None).unwrap();
        let dups: Vec<_> = page.messages.iter().filter(|m| m.msg_id == "dup").collect();
        assert_eq!(dups.len(), 1);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_out_of_order_timestamps_deliver_in_order() {
        let temp = TempDir::new().unwrap();
        let node = Node::new(single_node_config(&temp)).unwrap();
        node.start();
        await_leadership(&node).await;

        // Physically first, but timestamped later than the second message.
        let now = relaymq::timing::wall_clock_secs();
        node.submit(
            Message::new("late")
                .with_msg_id("m-late")
                .with_sender("A")
                .with_original_ts(now),
        )
        .await
        .unwrap();
        node.submit(
            Message::new("early")
                .with_msg_id("m-early")
                .with_sender("A")
                .with_original_ts(now - 0.5),
        )
        .await
        .unwrap();

        await_applied(&node, 2).await;

        // Both release once the hold-back window passes, earlier timestamp
        // first within A's stream.
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if node.ordering_stats().released >= 2 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("ordering buffer never released");

        let stats = node.ordering_stats();
        assert_eq!(stats.reorders, 1);
        let order: Vec<&str> = stats
            .recent_releases
            .iter()
            .map(|r| r.msg_id.as_str())
            .collect();
        assert_eq!(order, vec!["m-early", "m-late"]);
        let ts: Vec<f64> = stats.recent_releases.iter().map(|r| r.corrected_ts).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));

        node.shutdown();
    }

    #[tokio::test]
    async fn test_pagination_cursor() {
        let temp = TempDir::new().unwrap();
        let node = Node::new(single_node_config(&temp)).unwrap();
        node.start();
        await_leadership(&node).await;

        for i in 0..7 {
            node.submit(Message::new(format!("p{i}")).with_msg_id(format!("p{i}")))
                .await
                .unwrap();
        }
        await_applied(&node, 7).await;

        let first = node.query_messages(0, Some(3), None, None).unwrap();
        assert_eq!(first.messages.len(), 3);
        assert_eq!(first.next_after, Some(3));

        let second = node
            .query_messages(first.next_after.unwrap(), Some(3), None, None)
            .unwrap();
        assert_eq!(second.messages[0].seq, 4);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_force_delivery_flushes_buffer() {
        let temp = TempDir::new().unwrap();
        let mut config = single_node_config(&temp);
        config.hold_back = Duration::from_secs(60);
        let node = Node::new(config).unwrap();
        node.start();
        await_leadership(&node).await;

        node.submit(Message::new("x").with_msg_id("f1").with_sender("s"))
            .await
            .unwrap();
        await_applied(&node, 1).await;
        assert_eq!(node.ordering_stats().pending, 1);

        let records = node.force_delivery();
        assert_eq!(records.len(), 1);
        assert!(records[0].forced);
        let stats = node.ordering_stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.forced_deliveries, 1);

        node.shutdown();
    }
}

// ============================================================================
// HTTP surface
// ============================================================================

mod http_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PORT: u16 = 47711;

    #[tokio::test]
    async fn test_http_send_query_status() {
        let temp = TempDir::new().unwrap();
        let mut config = single_node_config(&temp);
        config.port = PORT;
        let node = Node::new(config).unwrap();
        node.start();

        let server = ApiServer::new(node.clone()).unwrap();
        tokio::spawn(server.run());
        await_leadership(&node).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let base = format!("http://127.0.0.1:{PORT}");
        let http = reqwest::Client::new();

        // Send.
        let resp = http
            .post(format!("{base}/send"))
            .json(&serde_json::json!({"payload": "hi", "msg_id": "h1", "sender": "a"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["seq"], 1);
        assert_eq!(body["msg_id"], "h1");
        assert!(body["corrected_ts"].as_f64().is_some());

        // Query.
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let body: serde_json::Value = http
                    .get(format!("{base}/messages?limit=10"))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                if body["messages"].as_array().map(|a| a.len()) == Some(1) {
                    assert_eq!(body["messages"][0]["msg_id"], "h1");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("message never appeared in /messages");

        // Status.
        let status: serde_json::Value = http
            .get(format!("{base}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["node_id"], "solo");
        assert_eq!(status["role"], "Leader");
        assert_eq!(status["commit_index"], 1);

        // Heartbeat probe.
        let hb: serde_json::Value = http
            .get(format!("{base}/heartbeat"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(hb["status"], "ok");

        // Future-dated correction is a 400 with a stable reason.
        let future = relaymq::timing::wall_clock_secs() + 60.0;
        let resp = http
            .post(format!("{base}/time/correct"))
            .json(&serde_json::json!({"ts": future}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["reason"], "invalid_timestamp");

        // Ordering status is always readable.
        let resp = http
            .get(format!("{base}/ordering/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        node.shutdown();
    }
}
