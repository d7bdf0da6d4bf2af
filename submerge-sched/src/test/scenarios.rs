//! End-to-end boundary scenarios driven through the public `Scheduler`
//! API, as opposed to the unit tests beside each module that poke the
//! store directly.

use std::collections::{BTreeMap, BTreeSet};

use test_log::test;

use crate::config::SchedulerConfig;
use crate::graph::GraphSubmission;
use crate::ids::{ClientId, TaskKey, Timestamp, WorkerAddr};
use crate::scheduler::Scheduler;
use crate::task::TaskState;

fn stim() -> crate::ids::StimulusId {
    "scenario".to_string()
}

#[test]
fn rebalance_moves_oldest_keys_from_overfull_to_empty_worker() {
    let mut cfg = SchedulerConfig::default();
    cfg.memory_rebalance_sender_min = 0.3;
    cfg.memory_rebalance_recipient_max = 0.6;
    cfg.memory_rebalance_sender_recipient_gap = 0.1;
    let mut sched = Scheduler::new(cfg);

    let a = WorkerAddr::from("tcp://a:1");
    let b = WorkerAddr::from("tcp://b:1");
    sched.add_worker(a.clone(), "ha".into(), 2, 2000, vec![], Timestamp(0.0), stim()).unwrap();
    sched.add_worker(b.clone(), "hb".into(), 2, 2000, vec![], Timestamp(0.0), stim()).unwrap();

    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));

    let keys: Vec<TaskKey> = (0..6).map(|i| TaskKey::from(format!("k{i}").as_str())).collect();
    let mut tasks = BTreeMap::new();
    for k in &keys {
        tasks.insert(k.clone(), vec![0u8]);
    }
    let submission = GraphSubmission {
        tasks,
        dependencies: BTreeMap::new(),
        keys: keys.clone(),
        client: client.clone(),
        user_priority: 0,
        annotations: BTreeMap::new(),
        fifo_timeout: 60.0,
        code: vec![],
    };
    sched.update_graph(submission, Timestamp(1.0), stim());
    for k in &keys {
        sched.client_desires_keys(&[k.clone()], &client);
    }

    // Report every completion as finishing on `a`, regardless of which
    // worker `decide_worker` actually picked -- a worker is always free to
    // report a replica for a task it was not the assigned executor for,
    // and `processing_to_memory` accepts it (cancelling the original
    // assignment), so this reliably piles every replica onto `a`.
    for k in &keys {
        sched.handle_worker_message(
            crate::messages::WorkerInbound::TaskFinished {
                key: k.clone(),
                worker: a.clone(),
                nbytes: Some(200),
                typename: Some("bytes".into()),
                start: 2.0,
                stop: 2.1,
            },
            Timestamp(2.1),
            stim(),
        );
    }
    for k in &keys {
        assert_eq!(sched.store.tasks.get(k).unwrap().state, TaskState::Memory);
    }

    let plan = sched.plan_rebalance(Timestamp(3.0), None, None);
    assert!(!plan.moves.is_empty());
    for mv in &plan.moves {
        assert_eq!(mv.sender, a);
        assert_eq!(mv.recipient, b);
    }

    sched.apply_rebalance(&plan, stim());
    for mv in &plan.moves {
        assert!(sched.store.tasks.get(&mv.key).unwrap().who_has.contains(&b));
        assert!(!sched.store.tasks.get(&mv.key).unwrap().who_has.contains(&a));
    }
}

#[test]
fn root_task_cohort_sticks_to_one_worker_until_quota_drains() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));

    for i in 0..4 {
        sched
            .add_worker(
                WorkerAddr::from(format!("tcp://w{i}:1").as_str()),
                format!("h{i}"),
                2,
                1_000_000,
                vec![],
                Timestamp(0.0),
                stim(),
            )
            .unwrap();
    }

    let keys: Vec<TaskKey> = (0..100).map(|i| TaskKey::from(format!("root-{i}").as_str())).collect();
    let mut tasks = BTreeMap::new();
    for k in &keys {
        tasks.insert(k.clone(), vec![0u8]);
    }
    let submission = GraphSubmission {
        tasks,
        dependencies: BTreeMap::new(),
        keys: keys.clone(),
        client: client.clone(),
        user_priority: 0,
        annotations: BTreeMap::new(),
        fifo_timeout: 60.0,
        code: vec![],
    };
    sched.update_graph(submission, Timestamp(1.0), stim());

    let assigned: BTreeSet<WorkerAddr> =
        keys.iter().filter_map(|k| sched.store.tasks.get(k).unwrap().processing_on.clone()).collect();

    // With a cohort far larger than 2x total threads, at least the first
    // batch should land on a single worker rather than spreading evenly.
    let first_worker = sched.store.tasks.get(&keys[0]).unwrap().processing_on.clone();
    assert!(first_worker.is_some());
    let same_as_first =
        keys.iter().take(5).filter(|k| sched.store.tasks.get(*k).unwrap().processing_on == first_worker).count();
    assert!(same_as_first >= 4, "expected most of the first few root tasks on one worker, got {same_as_first}");
    assert!(assigned.len() <= 4);
}
