//! End-to-end dispatcher tests that actually re-exec the real `crucible`
//! binary for `TRAIN_MODEL`'s child-process isolation path (`CARGO_BIN_EXE_*`
//! is only available to tests under `tests/`, never to `#[cfg(test)]`
//! modules inside the library itself).

use std::path::PathBuf;
use std::sync::Arc;

use crucible::cache::DataCache;
use crucible::config::{Config, ServerSpec};
use crucible::dataset::{Column, ColumnType, Dataset};
use crucible::dispatcher::{dispatch_jobs, Job};
use crucible::factory::{FactoryRegistry, MajorityClassFactory, SleepyFactory};
use crucible::protocol::Status;
use crucible::value::Value;
use crucible::worker::WorkerServer;

fn sample_dataset() -> Dataset {
    Dataset::new(
        vec![
            Column { name: "x0".into(), kind: ColumnType::Continuous },
            Column { name: "label".into(), kind: ColumnType::Categorical },
        ],
        vec![
            vec![Value::Float(1.0), Value::Category(1)],
            vec![Value::Float(2.0), Value::Category(2)],
            vec![Value::Float(3.0), Value::Category(2)],
        ],
    )
}

fn real_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_crucible"))
}

fn test_config(servers: Vec<ServerSpec>, worker_timeout_ms: u64) -> Config {
    Config {
        servers,
        num_seeded_hosts: 1,
        remote_read_timeout_ms: 2_000,
        remote_worker_timeout_ms: worker_timeout_ms,
        connect_timeout_ms: 500,
        number_of_remote_workers: 4,
        limit_network_io: true,
        listen_addr: "127.0.0.1:0".into(),
        log_filter: "crucible=info".into(),
    }
}

async fn spawn_worker_with_dataset(dataset: &Dataset, worker_timeout_ms: u64) -> ServerSpec {
    let cache = DataCache::new();
    cache.insert(dataset.clone());
    let config = Arc::new(test_config(vec![], worker_timeout_ms));
    let mut registry = FactoryRegistry::new();
    registry.register("majority", Arc::new(MajorityClassFactory));
    registry.register("sleepy", Arc::new(SleepyFactory));
    let server = WorkerServer::new(config, cache, registry)
        .unwrap()
        .with_exe(real_exe());
    let bound = server.bind("127.0.0.1:0").await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());
    ServerSpec {
        name: format!("worker-{}", addr.port()),
        host: "127.0.0.1".into(),
        port: addr.port(),
    }
}

// S4 (score gate), end to end: two jobs trained for real by a re-exec'd
// child process. Both tie at the majority-class misclassification score;
// only the first one read gets `SEND_CODE`, the second only ties the
// now-updated running best so it's discarded.
#[tokio::test]
async fn dispatches_jobs_round_robin_and_keeps_best_code() {
    let dataset = sample_dataset();
    let s0 = spawn_worker_with_dataset(&dataset, 5_000).await;
    let s1 = spawn_worker_with_dataset(&dataset, 5_000).await;
    let config = test_config(vec![s0, s1], 5_000);

    let jobs = vec![
        Job { factory: "majority".into(), transforms: "none".into(), dataset_hash: dataset.hash },
        Job { factory: "majority".into(), transforms: "none".into(), dataset_hash: dataset.hash },
    ];

    let results = dispatch_jobs(&config, &config.servers, jobs).await;
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.response, Status::Ok);
        assert_eq!(result.score, 1);
    }
    let with_code = results.iter().filter(|r| r.code.is_some()).count();
    assert_eq!(with_code, 1);
}

// S6 (worker timeout): a factory that sleeps far longer than
// `remote_worker_timeout` causes the worker's child to self-terminate; the
// dispatcher observes the closed connection and marks the job failed with
// `i32::MAX` rather than hanging.
#[tokio::test]
async fn worker_timeout_marks_job_failed_with_max_score() {
    let dataset = sample_dataset();
    let worker_timeout_ms = 200;
    let server = spawn_worker_with_dataset(&dataset, worker_timeout_ms).await;
    let config = test_config(vec![server], worker_timeout_ms);

    let jobs = vec![Job {
        factory: "sleepy".into(),
        transforms: "none".into(),
        dataset_hash: dataset.hash,
    }];

    let start = std::time::Instant::now();
    let results = dispatch_jobs(&config, &config.servers, jobs).await;
    assert_eq!(results[0].response, Status::ReadError);
    assert_eq!(results[0].score, i32::MAX);
    // Should resolve in roughly one worker_timeout, not hang indefinitely.
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}
