//! Integration tests for replication and reads across a live cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use replicated_queue::command::Command;
use replicated_queue::error::LogError;
use replicated_queue::interpreter::{ApplyOutcome, Query, QueryResult};
use replicated_queue::schedule::QueueStats;

use common::{TestCluster, WAIT};

fn set(key: &str, value: &str) -> Command {
    Command::SetKeyValue {
        key: key.into(),
        value: value.as_bytes().to_vec(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_writes_visible_on_every_node() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17401)?;
    cluster.elect(1).await?;

    let outcomes = cluster
        .node(1)
        .propose(
            &[
                set("color", "blue"),
                Command::QueuePush {
                    key: "jobs".into(),
                    id: "job-1".into(),
                    now_ticks: 0,
                    retry_timeout_seconds: 30,
                    retry_delays_seconds: vec![2],
                    retryable_status_codes: vec![500],
                    value: b"payload".to_vec(),
                },
            ],
            WAIT,
        )
        .await?;
    assert_eq!(outcomes[0], ApplyOutcome::Stored);
    assert_eq!(outcomes[1], ApplyOutcome::Pushed { id: "job-1".into() });

    // The read barrier makes the write visible on followers without sleeping.
    for id in 1..=3 {
        let value = cluster
            .node(id)
            .read(Query::Get { key: "color".into() }, WAIT)
            .await?;
        assert_eq!(value, QueryResult::Value(Some(b"blue".to_vec())), "node {id}");

        let stats = cluster
            .node(id)
            .read(
                Query::QueueStats {
                    key: "jobs".into(),
                    now_ticks: 0,
                },
                WAIT,
            )
            .await?;
        assert_eq!(
            stats,
            QueryResult::QueueStats(QueueStats {
                length: 1,
                available: 1,
                running: 0
            })
        );
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_rejects_writes() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17411)?;
    cluster.elect(1).await?;

    let result = cluster.node(2).propose(&[set("k", "v")], WAIT).await;
    assert_eq!(result, Err(LogError::NotLeader { leader: Some(1) }));

    let value = cluster
        .node(1)
        .read(Query::Get { key: "k".into() }, WAIT)
        .await?;
    assert_eq!(value, QueryResult::Value(None));

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejects_before_election() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17421)?;

    let write = cluster.node(1).propose(&[set("k", "v")], WAIT).await;
    assert_eq!(write, Err(LogError::NotLeader { leader: None }));

    let read = cluster
        .node(2)
        .read(Query::Get { key: "k".into() }, WAIT)
        .await;
    assert_eq!(read, Err(LogError::NotLeader { leader: None }));

    cluster.shutdown();
    Ok(())
}

/// Writers bump per-writer counters through the leader while readers on
/// random nodes check that no acknowledged write is ever missing.
#[tokio::test(flavor = "multi_thread")]
async fn test_reads_observe_acknowledged_writes() -> Result<()> {
    let cluster = Arc::new(TestCluster::spawn(3, 17431)?);
    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await?;

    let mut tasks = Vec::new();
    for writer in 0..4u32 {
        let cluster = Arc::clone(&cluster);
        tasks.push(tokio::spawn(async move {
            let key = format!("counter-{writer}");
            for n in 1..=15u32 {
                cluster
                    .node(leader)
                    .propose(&[set(&key, &n.to_string())], WAIT)
                    .await?;

                let (reader, pause) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(1..=3u64), rng.gen_range(0..5u64))
                };
                tokio::time::sleep(Duration::from_millis(pause)).await;
                let seen = cluster
                    .node(reader)
                    .read(Query::Get { key: key.clone() }, WAIT)
                    .await?;
                let QueryResult::Value(Some(bytes)) = seen else {
                    anyhow::bail!("node {reader} lost {key}");
                };
                let seen: u32 = String::from_utf8(bytes)?.parse()?;
                assert!(seen >= n, "node {reader} read {seen} after write {n} of {key}");
            }
            anyhow::Ok(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    if let Ok(cluster) = Arc::try_unwrap(cluster) {
        cluster.shutdown();
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pop_hands_each_element_out_once() -> Result<()> {
    let cluster = TestCluster::spawn(3, 17441)?;
    cluster.elect(2).await?;
    let leader = cluster.node(2);

    let pushes: Vec<Command> = (0..6)
        .map(|i| Command::QueuePush {
            key: "q".into(),
            id: format!("e{i}"),
            now_ticks: 0,
            retry_timeout_seconds: 30,
            retry_delays_seconds: vec![],
            retryable_status_codes: vec![],
            value: vec![i],
        })
        .collect();
    leader.propose(&pushes, WAIT).await?;

    let pop = [Command::QueuePop {
        key: "q".into(),
        count: 2,
        now_ticks: 1,
    }];
    let pops = (0..4).map(|_| leader.propose(&pop, WAIT));
    let mut handed_out = Vec::new();
    for outcome in futures::future::join_all(pops).await {
        match outcome?.pop() {
            Some(ApplyOutcome::Popped(items)) => {
                handed_out.extend(items.into_iter().map(|item| item.id))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    handed_out.sort();
    assert_eq!(handed_out, ["e0", "e1", "e2", "e3", "e4", "e5"]);

    cluster.shutdown();
    Ok(())
}
