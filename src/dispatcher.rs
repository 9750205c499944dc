//! Job dispatcher (C9): round-robins `TRAIN_MODEL` requests across a
//! disseminated roster, polls every in-flight job non-blockingly, applies
//! the score gate, and cancels jobs that outlive their wall-clock budget.
//!
//! Grounded on `examples/original_source/net.c`'s
//! `distribute_jobs_to_servers`/`remote_job_try_to_start`/
//! `remote_job_is_ready`/`remote_job_read_result`/`remote_job_cancel`/
//! `remote_job_age` -- the same control-flow shape (one start-attempt plus
//! one poll-all-in-flight pass per loop iteration) ported to `tokio`.
//! `TcpStream::readable().now_or_never()` stands in for `select()` with a
//! zero timeout: polling a future once without awaiting it is the async
//! analogue of a non-blocking `select`, the same substitution
//! `examples/StractOrg-stract/crates/core/src/ampc/worker.rs` makes when it
//! needs a non-blocking check inside a poll loop (`BoxFuture`/`FutureExt`).

use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::ast::Node;
use crate::config::{Config, ServerSpec};
use crate::dataset::Hash;
use crate::protocol::{
    read_connection_header, read_data_follows_then_node, read_train_model_header,
    send_fetch_decision, send_train_model_request, FetchDecision, Status, TrainModelHeader,
};

/// One unit of work: a factory/transforms pair against a previously
/// disseminated dataset (§4.4/§4.7 -- the dataset itself travels via C8,
/// only its hash travels with the job).
#[derive(Debug, Clone)]
pub struct Job {
    pub factory: String,
    pub transforms: String,
    pub dataset_hash: Hash,
}

/// The result slot a `Job` resolves into: `score`/`code` mirror the
/// original's `job_t.score`/`job_t.code`, `response` records which status
/// the remote (or the dispatcher's own bookkeeping) ultimately reported.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub server: String,
    pub response: Status,
    pub score: i32,
    pub code: Option<Node>,
    pub cpu_time_ms: i64,
}

impl JobResult {
    fn failed(reason: Status) -> Self {
        JobResult {
            server: String::new(),
            response: reason,
            score: i32::MAX,
            code: None,
            cpu_time_ms: 0,
        }
    }
}

struct RunningJob {
    stream: TcpStream,
    server_name: String,
    job_index: usize,
    started: Instant,
}

/// What trying to start a job against one server resolved to: a live
/// connection, a server that's alive but has no free slot (try a different
/// one next time, same as `remote_server_t.busy`), or a server that failed
/// at the DNS/connect/header-read stage (`remote_server_is_broken` --
/// skipped for the rest of this dispatch round, per §3's `RemoteServer`
/// broken-flag).
enum StartOutcome {
    Started(TcpStream),
    Busy,
    Broken,
}

/// Connects to `server` and sends the `TRAIN_MODEL` request, exactly
/// mirroring `connect_to_remote_server` + `remote_job_try_to_start`'s split
/// between a transient (busy) and a durable (broken) failure.
async fn try_start(config: &Config, server: &ServerSpec, job: &Job) -> StartOutcome {
    let connect = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(server.addr()))
        .await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        _ => return StartOutcome::Broken,
    };

    let header = match tokio::time::timeout(config.remote_read_timeout(), read_connection_header(&mut stream))
        .await
    {
        Ok(Ok(header)) => header,
        _ => return StartOutcome::Broken,
    };
    if !header.accept {
        return StartOutcome::Busy;
    }

    match send_train_model_request(&mut stream, &job.dataset_hash, &job.factory, &job.transforms)
        .await
    {
        Ok(()) => StartOutcome::Started(stream),
        Err(_) => StartOutcome::Broken,
    }
}

/// Finds the next non-broken roster index at or after `round_robin`,
/// advancing `round_robin` past it. Returns `None` once every server has
/// been marked broken (the original's `!config_has_remote_servers()` check).
fn next_live_server(broken: &[bool], round_robin: &mut usize) -> Option<usize> {
    if broken.iter().all(|b| *b) {
        return None;
    }
    loop {
        let idx = *round_robin % broken.len();
        *round_robin += 1;
        if !broken[idx] {
            return Some(idx);
        }
    }
}

fn is_readable(stream: &TcpStream) -> bool {
    stream.readable().now_or_never().is_some()
}

/// Reads one ready job's result and applies the score gate, mutating
/// `best_score` exactly the way `remote_job_read_result` does: the running
/// best only ever moves down, and only when `limit_network_io` is set
/// (`net.c:726`: `if(config_limit_network_io && j->job->score < *best_score)
/// *best_score = j->job->score;`). With the flag clear, `best_score` stays
/// at `i32::MAX` for the whole dispatch, so the `score < best_score` gate
/// below sends every job's code -- the original's "don't bother gating,
/// fetch everything" mode. Every read is bounded by `read_timeout`, matching
/// the original's `filereader_with_timeout_new(sock, config_remote_read_timeout)`
/// wrapping every socket reader (§5).
async fn read_result(
    stream: &mut TcpStream,
    best_score: &mut i32,
    limit_network_io: bool,
    read_timeout: Duration,
) -> Result<(Status, i32, Option<Node>, i64), crate::error::Error> {
    let header = tokio::time::timeout(read_timeout, read_train_model_header(stream))
        .await
        .map_err(|_| crate::error::Error::Timeout)??;
    match header {
        TrainModelHeader::DatasetUnknown => Ok((Status::DatasetUnknown, i32::MAX, None, 0)),
        TrainModelHeader::FactoryUnknown => Ok((Status::FactoryUnknown, i32::MAX, None, 0)),
        TrainModelHeader::Trained { cpu_time_ms, score } => {
            let decision = if score < *best_score {
                FetchDecision::SendCode
            } else {
                FetchDecision::DiscardCode
            };
            send_fetch_decision(stream, decision).await?;

            let code = if decision == FetchDecision::SendCode {
                Some(
                    tokio::time::timeout(read_timeout, read_data_follows_then_node(stream))
                        .await
                        .map_err(|_| crate::error::Error::Timeout)??,
                )
            } else {
                None
            };

            if limit_network_io && score < *best_score {
                *best_score = score;
            }

            Ok((Status::Ok, score, code, cpu_time_ms))
        }
    }
}

/// Dispatches `jobs` round-robin across `roster`, one result per job, in
/// the order `jobs` was given (§4.7). Runs until every job is either
/// finished, reported a protocol-level failure, or is cancelled for running
/// past `remote_worker_timeout` once every job has been started at least
/// once.
pub async fn dispatch_jobs(config: &Config, roster: &[ServerSpec], jobs: Vec<Job>) -> Vec<JobResult> {
    let total = jobs.len();
    let mut results: Vec<Option<JobResult>> = (0..total).map(|_| None).collect();

    if roster.is_empty() {
        warn!("no remote servers available; failing all jobs");
        return (0..total)
            .map(|_| JobResult::failed(Status::ReadError))
            .collect();
    }

    info!(open_jobs = total, "dispatching jobs");

    let mut running: Vec<RunningJob> = Vec::new();
    let mut round_robin = 0usize;
    let mut next_job = 0usize;
    let mut open_jobs = total;
    let mut best_score = i32::MAX;
    let mut broken = vec![false; roster.len()];
    let worker_timeout = config.remote_worker_timeout();
    let read_timeout = config.remote_read_timeout();
    let limit_network_io = config.limit_network_io;

    while open_jobs > 0 {
        if next_job < total {
            match next_live_server(&broken, &mut round_robin) {
                None => {
                    warn!("every remote server is broken; failing remaining jobs");
                    for i in next_job..total {
                        results[i] = Some(JobResult::failed(Status::ReadError));
                    }
                    open_jobs -= total - next_job;
                    next_job = total;
                }
                Some(idx) => {
                    let server = &roster[idx];
                    match try_start(config, server, &jobs[next_job]).await {
                        StartOutcome::Started(stream) => {
                            running.push(RunningJob {
                                stream,
                                server_name: server.name.clone(),
                                job_index: next_job,
                                started: Instant::now(),
                            });
                            next_job += 1;
                        }
                        StartOutcome::Busy => {}
                        StartOutcome::Broken => {
                            warn!(server = %server.name, "marking server broken for this dispatch round");
                            broken[idx] = true;
                        }
                    }
                }
            }
        }

        let all_started = next_job == total;
        let mut i = 0;
        while i < running.len() {
            let finished = poll_running_job(
                &mut running[i],
                &mut best_score,
                limit_network_io,
                read_timeout,
                all_started,
                worker_timeout,
            )
            .await;

            if let Some(result) = finished {
                results[running[i].job_index] = Some(result);
                running.remove(i);
                open_jobs -= 1;
            } else {
                i += 1;
            }
        }

        tokio::task::yield_now().await;
    }

    results.into_iter().map(|r| r.expect("every job slot filled")).collect()
}

/// Returns `Some(result)` once `job` is done (answered or cancelled),
/// `None` if it's still in flight.
async fn poll_running_job(
    job: &mut RunningJob,
    best_score: &mut i32,
    limit_network_io: bool,
    read_timeout: Duration,
    all_started: bool,
    worker_timeout: Duration,
) -> Option<JobResult> {
    if is_readable(&job.stream) {
        return Some(match read_result(&mut job.stream, best_score, limit_network_io, read_timeout).await {
            Ok((response, score, code, cpu_time_ms)) => {
                if response == Status::Ok {
                    info!(server = %job.server_name, score, "job finished");
                } else {
                    warn!(server = %job.server_name, ?response, "job failed");
                }
                JobResult {
                    server: job.server_name.clone(),
                    response,
                    score,
                    code,
                    cpu_time_ms,
                }
            }
            Err(e) => {
                warn!(server = %job.server_name, error = %e, "error reading job result");
                JobResult::failed(Status::ReadError)
            }
        });
    }

    // Cancellation only kicks in once every job has been started at least
    // once, matching the original's `num == jobs->num` guard: an unstarted
    // job shouldn't make a slow-but-live job time out early.
    if all_started && job.started.elapsed() > worker_timeout {
        warn!(server = %job.server_name, "job timed out");
        return Some(JobResult::failed(Status::ReadError));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DataCache;
    use crate::dataset::{Column, ColumnType, Dataset};
    use crate::factory::{FactoryRegistry, MajorityClassFactory};
    use crate::value::Value;
    use crate::worker::WorkerServer;
    use std::sync::Arc;

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

    async fn spawn_worker_with_dataset(dataset: &Dataset) -> ServerSpec {
        let cache = DataCache::new();
        cache.insert(dataset.clone());
        let config = Arc::new(Config {
            servers: vec![],
            num_seeded_hosts: 1,
            remote_read_timeout_ms: 2_000,
            remote_worker_timeout_ms: 2_000,
            connect_timeout_ms: 500,
            number_of_remote_workers: 4,
            limit_network_io: true,
            listen_addr: "127.0.0.1:0".into(),
            log_filter: "crucible=info".into(),
        });
        let mut registry = FactoryRegistry::new();
        registry.register("majority", Arc::new(MajorityClassFactory));
        let server = WorkerServer::new(config, cache, registry).unwrap();
        let bound = server.bind("127.0.0.1:0").await.unwrap();
        let addr = bound.local_addr().unwrap();
        tokio::spawn(bound.serve());
        ServerSpec {
            name: format!("worker-{}", addr.port()),
            host: "127.0.0.1".into(),
            port: addr.port(),
        }
    }

    fn dispatch_config(servers: Vec<ServerSpec>) -> Config {
        Config {
            servers,
            num_seeded_hosts: 1,
            remote_read_timeout_ms: 2_000,
            remote_worker_timeout_ms: 2_000,
            connect_timeout_ms: 500,
            number_of_remote_workers: 4,
            limit_network_io: true,
            listen_addr: "127.0.0.1:0".into(),
            log_filter: "crucible=info".into(),
        }
    }

    // The round-robin-plus-score-gate-against-a-really-trained-model path
    // needs the real `crucible` binary (`TRAIN_MODEL` re-execs it as a
    // child), which `CARGO_BIN_EXE_crucible` only exists for under
    // `tests/` -- see `tests/dispatcher_integration.rs`.

    #[tokio::test]
    async fn unknown_dataset_is_reported_without_crashing() {
        let dataset = sample_dataset();
        let server = spawn_worker_with_dataset(&dataset).await;
        let config = dispatch_config(vec![server]);

        let jobs = vec![Job {
            factory: "majority".into(),
            transforms: "none".into(),
            dataset_hash: [0xAB; 20],
        }];
        let results = dispatch_jobs(&config, &config.servers, jobs).await;
        assert_eq!(results[0].response, Status::DatasetUnknown);
        assert_eq!(results[0].score, i32::MAX);
    }

    #[tokio::test]
    async fn empty_roster_fails_every_job_immediately() {
        let config = dispatch_config(vec![]);
        let jobs = vec![Job {
            factory: "majority".into(),
            transforms: "none".into(),
            dataset_hash: [0u8; 20],
        }];
        let results = dispatch_jobs(&config, &config.servers, jobs).await;
        assert_eq!(results[0].response, Status::ReadError);
    }
}
