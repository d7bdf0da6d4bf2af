use std::collections::{BTreeMap, BTreeSet};

use test_log::test;

use crate::client::FIRE_AND_FORGET;
use crate::config::SchedulerConfig;
use crate::graph::{GraphSubmission, TaskAnnotations};
use crate::ids::{ClientId, StimulusId, TaskKey, Timestamp, WorkerAddr};
use crate::messages::{ClientOutbound, WorkerInbound};
use crate::scheduler::Scheduler;
use crate::task::TaskState;

pub(crate) mod scenarios;

fn stim() -> StimulusId {
    "test".to_string()
}

fn submit_chain(sched: &mut Scheduler, client: &ClientId, keys: &[&str], now: Timestamp) {
    let keys: Vec<TaskKey> = keys.iter().map(|k| TaskKey::from(*k)).collect();
    let mut tasks = BTreeMap::new();
    let mut deps = BTreeMap::new();
    for (i, k) in keys.iter().enumerate() {
        tasks.insert(k.clone(), vec![i as u8]);
        if i > 0 {
            deps.insert(k.clone(), BTreeSet::from([keys[i - 1].clone()]));
        }
    }
    let submission = GraphSubmission {
        tasks,
        dependencies: deps,
        keys: keys.clone(),
        client: client.clone(),
        user_priority: 0,
        annotations: BTreeMap::new(),
        fifo_timeout: 60.0,
        code: vec![],
    };
    sched.update_graph(submission, now, stim());
}

fn complete(sched: &mut Scheduler, key: &str, worker: &WorkerAddr, now: Timestamp) {
    sched.handle_worker_message(
        WorkerInbound::TaskFinished {
            key: TaskKey::from(key),
            worker: worker.clone(),
            nbytes: Some(200),
            typename: Some("bytes".to_string()),
            start: now.0,
            stop: now.0 + 0.1,
        },
        now,
        stim(),
    );
}

#[test]
fn linear_chain_of_three_forgets_intermediates() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));
    let w = WorkerAddr::from("tcp://w0:1");
    sched.add_worker(w.clone(), "h0".into(), 2, 1_000_000, vec![], Timestamp(0.0), stim()).unwrap();

    submit_chain(&mut sched, &client, &["x", "y", "z"], Timestamp(1.0));
    sched.client_desires_keys(&[TaskKey::from("z")], &client);

    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().state, TaskState::Processing);

    complete(&mut sched, "x", &w, Timestamp(2.0));
    assert_eq!(sched.store.tasks.get(&TaskKey::from("y")).unwrap().state, TaskState::Processing);

    complete(&mut sched, "y", &w, Timestamp(3.0));
    assert_eq!(sched.store.tasks.get(&TaskKey::from("z")).unwrap().state, TaskState::Processing);

    complete(&mut sched, "z", &w, Timestamp(4.0));

    assert_eq!(sched.store.tasks.get(&TaskKey::from("z")).unwrap().state, TaskState::Memory);
    assert!(!sched.store.tasks.contains_key(&TaskKey::from("x")));
    assert!(!sched.store.tasks.contains_key(&TaskKey::from("y")));
}

#[test]
fn worker_loss_releases_tasks_until_allowed_failures_exceeded() {
    let mut cfg = SchedulerConfig::default();
    cfg.allowed_failures = 3;
    let mut sched = Scheduler::new(cfg);
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));

    let mut w = WorkerAddr::from("tcp://w0:1");
    sched.add_worker(w.clone(), "h0".into(), 5, 1_000_000, vec![], Timestamp(0.0), stim()).unwrap();

    let keys: Vec<&str> = vec!["a", "b", "c", "d", "e"];
    let mut tasks = BTreeMap::new();
    for k in &keys {
        tasks.insert(TaskKey::from(*k), vec![0u8]);
    }
    let submission = GraphSubmission {
        tasks,
        dependencies: BTreeMap::new(),
        keys: keys.iter().map(|k| TaskKey::from(*k)).collect(),
        client: client.clone(),
        user_priority: 0,
        annotations: BTreeMap::new(),
        fifo_timeout: 60.0,
        code: vec![],
    };
    sched.update_graph(submission, Timestamp(1.0), stim());
    for k in &keys {
        sched.client_desires_keys(&[TaskKey::from(*k)], &client);
    }
    for k in &keys {
        assert_eq!(sched.store.tasks.get(&TaskKey::from(*k)).unwrap().state, TaskState::Processing);
    }

    for round in 0..3 {
        sched.remove_worker(&w, Timestamp(2.0 + round as f64), stim());
        for k in &keys {
            assert_eq!(sched.store.tasks.get(&TaskKey::from(*k)).unwrap().state, TaskState::Released);
        }
        w = WorkerAddr::from(format!("tcp://w{}:1", round + 1).as_str());
        sched.add_worker(w.clone(), "h".into(), 5, 1_000_000, vec![], Timestamp(2.5 + round as f64), stim()).unwrap();
        for k in &keys {
            assert_eq!(sched.store.tasks.get(&TaskKey::from(*k)).unwrap().state, TaskState::Processing);
        }
    }

    // Fourth loss crosses allowed_failures (3): tasks become erred instead
    // of released.
    sched.remove_worker(&w, Timestamp(10.0), stim());
    for k in &keys {
        assert_eq!(sched.store.tasks.get(&TaskKey::from(*k)).unwrap().state, TaskState::Erred);
    }
}

#[test]
fn forgotten_dependency_cancels_dependent() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));
    sched.add_worker(WorkerAddr::from("tcp://w0:1"), "h0".into(), 2, 1_000_000, vec![], Timestamp(0.0), stim())
        .unwrap();

    submit_chain(&mut sched, &client, &["x", "y"], Timestamp(1.0));
    sched.client_desires_keys(&[TaskKey::from("y")], &client);

    sched.cancel(&[TaskKey::from("x")], &client, true, Timestamp(2.0), stim());

    assert!(!sched.store.tasks.contains_key(&TaskKey::from("x")));
    assert!(!sched.store.tasks.contains_key(&TaskKey::from("y")));
}

#[test]
fn worker_restriction_parks_in_no_worker_until_named_worker_joins() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));

    let restricted_worker = WorkerAddr::from("tcp://w1:1");
    let mut annotations = BTreeMap::new();
    let mut restrictions = crate::task::Restrictions::default();
    restrictions.worker = Some(BTreeSet::from([restricted_worker.clone()]));
    annotations.insert(
        TaskKey::from("x"),
        TaskAnnotations { priority: None, restrictions, retries: 0, actor: false },
    );

    let submission = GraphSubmission {
        tasks: BTreeMap::from([(TaskKey::from("x"), vec![0u8])]),
        dependencies: BTreeMap::new(),
        keys: vec![TaskKey::from("x")],
        client: client.clone(),
        user_priority: 0,
        annotations,
        fifo_timeout: 60.0,
        code: vec![],
    };
    sched.update_graph(submission, Timestamp(0.0), stim());
    sched.client_desires_keys(&[TaskKey::from("x")], &client);

    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().state, TaskState::NoWorker);

    sched.add_worker(restricted_worker.clone(), "h1".into(), 2, 1_000_000, vec![], Timestamp(1.0), stim())
        .unwrap();

    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().state, TaskState::Processing);
    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().processing_on, Some(restricted_worker));
}

#[test]
fn fire_and_forget_survives_client_disconnect() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));
    let w = WorkerAddr::from("tcp://w0:1");
    sched.add_worker(w.clone(), "h0".into(), 2, 1_000_000, vec![], Timestamp(0.0), stim()).unwrap();

    submit_chain(&mut sched, &client, &["x"], Timestamp(1.0));
    sched.fire_and_forget(&[TaskKey::from("x")]);
    sched.remove_client(&client, Timestamp(2.0), stim());

    complete(&mut sched, "x", &w, Timestamp(3.0));
    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().state, TaskState::Memory);
    assert!(sched
        .store
        .tasks
        .get(&TaskKey::from("x"))
        .unwrap()
        .who_wants
        .contains(&ClientId::from(FIRE_AND_FORGET)));
}

#[test]
fn task_erred_notifies_wanting_clients() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));
    let w = WorkerAddr::from("tcp://w0:1");
    sched.add_worker(w.clone(), "h0".into(), 2, 1_000_000, vec![], Timestamp(0.0), stim()).unwrap();

    submit_chain(&mut sched, &client, &["x"], Timestamp(1.0));
    sched.client_desires_keys(&[TaskKey::from("x")], &client);

    let batch = sched.handle_worker_message(
        WorkerInbound::TaskErred {
            key: TaskKey::from("x"),
            worker: w,
            exception: "ValueError".into(),
            traceback: "...".into(),
            cause: None,
        },
        Timestamp(2.0),
        stim(),
    );

    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().state, TaskState::Erred);
    let sent_to_client = batch
        .to_clients
        .iter()
        .any(|(c, m)| c == &client && matches!(m, ClientOutbound::TaskErred { key, .. } if key == &TaskKey::from("x")));
    assert!(sent_to_client);
}

#[test]
fn retry_clears_error_and_reschedules() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));
    let w = WorkerAddr::from("tcp://w0:1");
    sched.add_worker(w.clone(), "h0".into(), 2, 1_000_000, vec![], Timestamp(0.0), stim()).unwrap();
    submit_chain(&mut sched, &client, &["x"], Timestamp(1.0));
    sched.client_desires_keys(&[TaskKey::from("x")], &client);

    sched.handle_worker_message(
        WorkerInbound::TaskErred {
            key: TaskKey::from("x"),
            worker: w,
            exception: "boom".into(),
            traceback: "".into(),
            cause: None,
        },
        Timestamp(2.0),
        stim(),
    );
    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().state, TaskState::Erred);

    sched.retry(&[TaskKey::from("x")], Timestamp(3.0), stim());
    assert_eq!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().state, TaskState::Processing);
    assert!(sched.store.tasks.get(&TaskKey::from("x")).unwrap().exception.is_none());
}

#[test]
fn keep_alive_is_a_pure_noop() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let batch = sched.handle_worker_message(WorkerInbound::KeepAlive, Timestamp(0.0), stim());
    assert!(batch.to_clients.is_empty());
    assert!(batch.to_workers.is_empty());
}

#[test]
fn graph_with_dependency_on_unknown_data_is_cancelled() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));
    sched.add_worker(WorkerAddr::from("tcp://w0:1"), "h0".into(), 2, 1_000_000, vec![], Timestamp(0.0), stim())
        .unwrap();

    let x = TaskKey::from("x");
    let missing = TaskKey::from("missing");
    let submission = GraphSubmission {
        tasks: BTreeMap::from([(x.clone(), vec![0u8])]),
        dependencies: BTreeMap::from([(x.clone(), BTreeSet::from([missing.clone()]))]),
        keys: vec![x.clone()],
        client: client.clone(),
        user_priority: 0,
        annotations: BTreeMap::new(),
        fifo_timeout: 60.0,
        code: vec![],
    };
    let batch = sched.update_graph(submission, Timestamp(1.0), stim());

    assert!(!sched.store.tasks.contains_key(&x));
    assert!(batch
        .to_clients
        .iter()
        .any(|(c, m)| c == &client && matches!(m, ClientOutbound::CancelledKey { key } if key == &x)));
}

#[test]
fn graph_submission_prunes_upstream_of_an_already_computed_node() {
    use crate::graph::update_graph;
    use crate::plugin::PluginRegistry;

    let mut store = crate::store::Store::new(SchedulerConfig::default());
    let mut plugins = PluginRegistry::new();
    let client = ClientId::from("c1");
    store.clients.insert(client.clone(), crate::client::ClientState::new(client.clone()));

    // p -> w is already fully computed and sitting in the store as w=memory.
    let p = TaskKey::from("p");
    let w = TaskKey::from("w");
    let group = crate::ids::GroupKey::from("g-1");
    store.ensure_group(&group, &crate::ids::PrefixKey::from("g"));
    let mut p_task = crate::task::Task::new(p.clone(), group.clone(), crate::ids::Priority::new(0, 0, 0));
    p_task.state = TaskState::Memory;
    p_task.who_has.insert(WorkerAddr::from("tcp://w0:1"));
    store.tasks.insert(p.clone(), p_task);
    let mut w_task = crate::task::Task::new(w.clone(), group.clone(), crate::ids::Priority::new(0, 0, 1));
    w_task.run_spec = Some(vec![1u8]);
    w_task.dependencies.insert(p.clone());
    w_task.state = TaskState::Memory;
    w_task.who_has.insert(WorkerAddr::from("tcp://w0:1"));
    store.tasks.insert(w.clone(), w_task);

    // A new submission resubmits the whole chain plus a new downstream
    // node z=h(w). p and w re-describe their (already-satisfied) upstream
    // graph the way a client library does when it doesn't track what the
    // scheduler already knows.
    let z = TaskKey::from("z");
    let submission = GraphSubmission {
        tasks: BTreeMap::from([(p.clone(), vec![0u8]), (w.clone(), vec![1u8]), (z.clone(), vec![2u8])]),
        dependencies: BTreeMap::from([(w.clone(), BTreeSet::from([p.clone()])), (z.clone(), BTreeSet::from([w.clone()]))]),
        keys: vec![z.clone()],
        client: client.clone(),
        user_priority: 0,
        annotations: BTreeMap::new(),
        fifo_timeout: 60.0,
        code: vec![],
    };
    update_graph(&mut store, &mut plugins, submission, Timestamp(2.0), stim());

    // The already-done nodes are untouched, and the new node is wired to
    // the existing (not a freshly recreated) `w`.
    assert_eq!(store.tasks.get(&p).unwrap().state, TaskState::Memory);
    assert_eq!(store.tasks.get(&w).unwrap().state, TaskState::Memory);
    assert!(store.tasks.get(&z).unwrap().dependencies.contains(&w));
    assert!(store.tasks.get(&w).unwrap().dependents.contains(&z));
}

#[test]
fn completed_graph_reports_key_in_memory_once_and_release_empties_the_table() {
    let mut sched = Scheduler::new(SchedulerConfig::default());
    let client = ClientId::from("c1");
    sched.add_client(client.clone(), Timestamp(0.0));
    let w = WorkerAddr::from("tcp://w0:1");
    sched.add_worker(w.clone(), "h0".into(), 2, 1_000_000, vec![], Timestamp(0.0), stim()).unwrap();

    submit_chain(&mut sched, &client, &["x", "y", "z"], Timestamp(1.0));
    sched.client_desires_keys(&[TaskKey::from("x"), TaskKey::from("y"), TaskKey::from("z")], &client);

    let mut key_in_memory_count: BTreeMap<TaskKey, usize> = BTreeMap::new();
    for key in ["x", "y", "z"] {
        let batch = sched.handle_worker_message(
            WorkerInbound::TaskFinished {
                key: TaskKey::from(key),
                worker: w.clone(),
                nbytes: Some(200),
                typename: Some("bytes".to_string()),
                start: 2.0,
                stop: 2.1,
            },
            Timestamp(2.0),
            stim(),
        );
        for (c, m) in &batch.to_clients {
            if let ClientOutbound::KeyInMemory { key, .. } = m {
                if c == &client {
                    *key_in_memory_count.entry(key.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    for key in ["x", "y", "z"].map(TaskKey::from) {
        assert_eq!(key_in_memory_count.get(&key).copied().unwrap_or(0), 1, "expected exactly one key-in-memory for {key}");
        assert_eq!(sched.store.tasks.get(&key).unwrap().state, TaskState::Memory);
    }

    sched.client_releases_keys(
        &[TaskKey::from("x"), TaskKey::from("y"), TaskKey::from("z")],
        &client,
        Timestamp(3.0),
        stim(),
    );

    assert!(sched.store.tasks.is_empty());
    assert!(sched.store.workers.get(&w).unwrap().has_what.is_empty());
}
