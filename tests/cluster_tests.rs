//! Multi-Node Consensus Tests
//!
//! Drives a three-node cluster over an in-process transport: elections,
//! replication, failover, and rejoin catch-up. Elections are triggered
//! explicitly so the scenarios stay deterministic.

mod common;

use common::{RouterSource, TestCluster};
use pretty_assertions::assert_eq;
use relaymq::{catch_up, Message, Role};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_basic_commit_replicates_to_all() {
    let cluster = TestCluster::new(3);
    assert!(cluster.nodes[0].start_election().await.unwrap());
    assert_eq!(cluster.leaders(), vec![0]);

    let (term, seq) = cluster.nodes[0]
        .leader_append(Message::new("hi").with_msg_id("a"))
        .await
        .unwrap();
    assert_eq!(seq, 1);

    for i in 0..3 {
        assert!(cluster.await_commit(i, 1, WAIT).await, "node {i} never committed");
        let entry = cluster.nodes[i].log_entry(1).unwrap();
        assert_eq!(entry.term, term);
        assert_eq!(entry.message.msg_id, "a");
        assert_eq!(entry.message.seq, 1);
        // Durable on every node.
        assert_eq!(cluster.stores[i].get(1).unwrap().unwrap().message.msg_id, "a");
    }
}

#[tokio::test]
async fn test_followers_learn_leader_and_redirect() {
    let cluster = TestCluster::new(3);
    assert!(cluster.nodes[0].start_election().await.unwrap());

    // Heartbeats carry the leader's URL to the followers.
    assert!(cluster.await_commit(0, 0, WAIT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = cluster.nodes[1]
        .leader_append(Message::new("x"))
        .await
        .unwrap_err();
    match err {
        relaymq::ClusterError::NotLeader { leader_url } => {
            assert_eq!(leader_url.as_deref(), Some(cluster.url(0)));
        }
        other => panic!("expected NotLeader, got {other}"),
    }
}

#[tokio::test]
async fn test_failover_elects_new_leader_with_higher_term() {
    let cluster = TestCluster::new(3);
    assert!(cluster.nodes[0].start_election().await.unwrap());
    let old_term = cluster.nodes[0].current_term();

    cluster.nodes[0]
        .leader_append(Message::new("before").with_msg_id("b1"))
        .await
        .unwrap();
    assert!(cluster.await_commit(1, 1, WAIT).await);

    // Kill the leader; a follower stands for election.
    cluster.router.set_down(cluster.url(0), true);
    assert!(cluster.nodes[1].start_election().await.unwrap());
    assert_eq!(cluster.nodes[1].role(), Role::Leader);
    assert!(cluster.nodes[1].current_term() > old_term);

    // New sends succeed through the new leader.
    let (_, seq) = cluster.nodes[1]
        .leader_append(Message::new("after").with_msg_id("b2"))
        .await
        .unwrap();
    assert_eq!(seq, 2);
    assert!(cluster.await_commit(1, 2, WAIT).await);
    assert!(cluster.await_commit(2, 2, WAIT).await);

    // The old leader rejoins and steps down on the first higher-term
    // heartbeat, converging on the same log.
    cluster.router.set_down(cluster.url(0), false);
    assert!(cluster.await_commit(0, 2, WAIT).await);
    assert_eq!(cluster.nodes[0].role(), Role::Follower);
    assert_eq!(cluster.leaders(), vec![1]);
    assert_eq!(cluster.nodes[0].log_entry(2).unwrap().message.msg_id, "b2");
}

#[tokio::test]
async fn test_log_matching_across_nodes() {
    let cluster = TestCluster::new(3);
    assert!(cluster.nodes[0].start_election().await.unwrap());

    for i in 0..5 {
        cluster.nodes[0]
            .leader_append(Message::new(format!("m{i}")).with_msg_id(format!("m{i}")))
            .await
            .unwrap();
    }
    for i in 0..3 {
        assert!(cluster.await_commit(i, 5, WAIT).await);
    }

    // Same index, same term => byte-identical consensus fields.
    for index in 1..=5 {
        let reference = cluster.nodes[0].log_entry(index).unwrap();
        for node in &cluster.nodes[1..] {
            let entry = node.log_entry(index).unwrap();
            assert_eq!(entry.term, reference.term);
            assert_eq!(entry.message.msg_id, reference.message.msg_id);
            assert_eq!(entry.message.payload, reference.message.payload);
            assert_eq!(entry.message.original_ts, reference.message.original_ts);
        }
    }
}

#[tokio::test]
async fn test_rejoin_catch_up_converges() {
    let cluster = TestCluster::new(3);
    assert!(cluster.nodes[0].start_election().await.unwrap());

    // Node 2 misses ten commits.
    cluster.router.set_down(cluster.url(2), true);
    for i in 0..10 {
        cluster.nodes[0]
            .leader_append(Message::new(format!("m{i}")).with_msg_id(format!("m{i}")))
            .await
            .unwrap();
    }
    assert!(cluster.await_commit(0, 10, WAIT).await);
    assert_eq!(cluster.nodes[2].commit_index(), 0);

    // It dials out and pulls everything it missed from a reachable peer
    // before the leader's replication has noticed it is back.
    let source = RouterSource { router: cluster.router.clone() };
    let peers: Vec<String> = vec![cluster.url(0).to_string(), cluster.url(1).to_string()];
    let installed = catch_up(&cluster.nodes[2], &source, &peers).await.unwrap();
    cluster.router.set_down(cluster.url(2), false);
    assert_eq!(installed, 10);
    assert_eq!(cluster.nodes[2].commit_index(), 10);
    for index in 1..=10 {
        assert_eq!(
            cluster.nodes[2].log_entry(index).unwrap().message.msg_id,
            cluster.nodes[0].log_entry(index).unwrap().message.msg_id
        );
    }
}

#[tokio::test]
async fn test_election_safety_single_leader_per_term() {
    let cluster = TestCluster::new(3);
    assert!(cluster.nodes[0].start_election().await.unwrap());
    let term = cluster.nodes[0].current_term();

    // A rival election in the same landscape bumps the term; the old
    // leader cannot keep term T, and T never gains a second leader.
    assert!(cluster.nodes[1].start_election().await.unwrap());
    let new_term = cluster.nodes[1].current_term();
    assert!(new_term > term);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let leaders = cluster.leaders();
    assert_eq!(leaders.len(), 1);
    assert_eq!(cluster.nodes[leaders[0]].current_term(), new_term);
}
