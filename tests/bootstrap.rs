mod common;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use pgas::{Config, Error, Node, NodeSpec, ThreadId};

use common::{run_cluster, values};

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_see_four_threads() {
    let seen = values(
        run_cluster(&[2, 2], |ctx| async move {
            ctx.barrier().await?;
            Ok((ctx.my_id(), ctx.thread_count(), ctx.node_count()))
        })
        .await,
    );
    let ids: HashSet<ThreadId> = seen.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids, (0..4).collect::<HashSet<_>>());
    for (_, thread_count, node_count) in seen {
        assert_eq!(thread_count, 4);
        assert_eq!(node_count, 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn physical_ids_follow_the_node_list() {
    // run twice; hello arrival order differs but the mapping must not
    let layout = [2, 1, 2, 1];
    let mut mappings = Vec::new();
    for _ in 0..2 {
        let mapping = values(
            run_cluster(&layout, |ctx| async move { Ok((ctx.my_id(), ctx.physical_id())) }).await,
        );
        mappings.push(mapping);
    }
    assert_eq!(mappings[0], mappings[1]);
    assert_eq!(
        mappings[0],
        vec![(0, 0), (1, 0), (2, 1), (3, 2), (4, 2), (5, 3)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_runs_alone() {
    let seen = values(
        run_cluster(&[3], |ctx| async move {
            ctx.barrier().await?;
            ctx.barrier().await?;
            Ok(ctx.my_id())
        })
        .await,
    );
    assert_eq!(seen, vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn barrier_rounds_never_overlap() {
    const ROUNDS: usize = 25;
    let layout = [2, 1, 2];
    let threads: usize = layout.iter().sum();
    let arrivals = Arc::new(AtomicUsize::new(0));

    let counter = arrivals.clone();
    let outcomes = run_cluster(&layout, move |ctx| {
        let arrivals = counter.clone();
        async move {
            for round in 0..ROUNDS {
                arrivals.fetch_add(1, Ordering::SeqCst);
                ctx.barrier().await?;
                // nobody leaves round r before all threads reached it
                let seen = arrivals.load(Ordering::SeqCst);
                assert!(
                    seen >= (round + 1) * threads,
                    "thread {} left round {} after only {} arrivals",
                    ctx.my_id(),
                    round,
                    seen
                );
                // and nobody reaches round r + 2 while anyone is still in r
                assert!(seen <= (round + 2) * threads);
            }
            Ok(())
        }
    })
    .await;
    values(outcomes);
    assert_eq!(arrivals.load(Ordering::SeqCst), ROUNDS * threads);
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_barrier_pairs_calls() {
    let outcomes = run_cluster(&[2, 2], |ctx| async move {
        assert!(matches!(
            ctx.barrier_with(ctx.my_id()).await,
            Err(Error::SelfBarrier(_))
        ));
        assert!(matches!(
            ctx.barrier_with(99).await,
            Err(Error::UnknownThread(99))
        ));
        // 0 pairs with 3 across nodes, 1 with 2
        let peer = 3 - ctx.my_id();
        for _ in 0..5 {
            ctx.barrier_with(peer).await?;
        }
        Ok(())
    })
    .await;
    values(outcomes);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_threads_are_reported_per_thread() {
    let outcomes = run_cluster(&[2, 2], |ctx| async move {
        match ctx.my_id() {
            1 => panic!("thread 1 gives up"),
            2 => Err(Error::Storage("thread 2 gives up".into())),
            id => Ok(id),
        }
    })
    .await;
    assert_eq!(outcomes.len(), 4);
    assert_eq!(*outcomes[0].1.as_ref().unwrap(), 0);
    assert!(matches!(outcomes[1].1, Err(Error::ThreadPanicked(1))));
    assert!(matches!(outcomes[2].1, Err(Error::Storage(_))));
    assert_eq!(*outcomes[3].1.as_ref().unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_gives_up_when_threads_are_missing() {
    let config = Config::builder()
        .retry_count(0)
        .retry_delay(Duration::from_millis(10))
        .max_bootstrap_time(Duration::from_millis(300))
        .build();
    // the root waits for a second node that never comes
    let spec = NodeSpec::builder().thread_ids(vec![0]).thread_count(2).build();
    let node = Node::bind(config, spec).await.unwrap();
    let outcome = node.run(|ctx| async move { Ok(ctx.my_id()) }).await;
    assert!(matches!(outcome, Err(Error::BootstrapTimeout(_))));
}
