//! Bounded worker pool (C7): limits how many `TRAIN_MODEL` factory
//! invocations run concurrently, each isolated in its own re-exec'd child
//! process.
//!
//! Grounded on `examples/original_source/net.c`'s `start_server`
//! worker-table bookkeeping (`server.num_workers`, the signal-blocked
//! critical section around `fork()`) for the `free -> reserved -> running
//! -> reaping -> free` slot lifecycle, and the teacher's `WorkerGuard`
//! pattern in `examples/StractOrg-stract/crates/core/src/mapreduce/manager.rs`
//! for a `Drop` impl that releases a slot without needing an async lock.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

use crate::ast::Node;
use crate::codec::{
    decode_node, encode_node, read_compressed_int, read_string, write_compressed_int,
    write_string, KEEP_STRINGS,
};
use crate::dataset::{dataset_read, dataset_write, Dataset};
use crate::error::Error;

/// A booked slot (the `reserved` state, carried through `running` by whoever
/// holds it). Dropping it performs the `reaping -> free` transition.
pub struct PoolSlot {
    running: Arc<Mutex<usize>>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        *self.running.lock().unwrap() -= 1;
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    running: Arc<Mutex<usize>>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            running: Arc::new(Mutex::new(0)),
            max_workers,
        }
    }

    pub fn num_running(&self) -> usize {
        *self.running.lock().unwrap()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// The `free -> reserved` transition, atomic under a single mutex (§4.6):
    /// returns `None` if every slot is taken. The lock is never held across
    /// an `.await`, so the critical section is as short as the original's
    /// signal-blocked `fork()` call.
    pub fn reserve(&self) -> Option<PoolSlot> {
        let mut running = self.running.lock().unwrap();
        if *running >= self.max_workers {
            return None;
        }
        *running += 1;
        Some(PoolSlot {
            running: Arc::clone(&self.running),
        })
    }
}

/// What a child process reports back for one `TRAIN_MODEL` job.
pub struct TrainOutcome {
    pub node: Node,
    pub score: i32,
    pub cpu_time_ms: i64,
}

/// Writes a training job: the dataset, then the factory name, then the
/// transforms string. Used on the parent side of the stdin pipe.
async fn write_job<W: AsyncWrite + Unpin>(
    w: &mut W,
    dataset: &Dataset,
    factory: &str,
    transforms: &str,
) -> Result<(), Error> {
    dataset_write(w, dataset).await?;
    let mut buf = Vec::new();
    write_string(&mut buf, factory, KEEP_STRINGS);
    write_string(&mut buf, transforms, KEEP_STRINGS);
    w.write_all(&buf).await?;
    Ok(())
}

/// Reads a training job off stdin; this is the `--run-training-job` mode's
/// entry point into the shared wire format.
pub async fn read_job<R: AsyncRead + Unpin + Send>(
    r: &mut R,
) -> Result<(Dataset, String, String), Error> {
    let dataset = dataset_read(r).await?;
    let factory = read_string(r).await?;
    let transforms = read_string(r).await?;
    Ok((dataset, factory, transforms))
}

/// Writes a training result to stdout; used by the `--run-training-job`
/// mode once it has a `(Node, score)` pair from the resolved factory.
pub async fn write_result<W: AsyncWrite + Unpin>(
    w: &mut W,
    node: &Node,
    score: i32,
) -> Result<(), Error> {
    let mut buf = Vec::new();
    encode_node(&mut buf, node, KEEP_STRINGS);
    write_compressed_int(&mut buf, score);
    w.write_all(&buf).await?;
    Ok(())
}

async fn read_result<R: AsyncRead + Unpin + Send>(r: &mut R) -> Result<(Node, i32), Error> {
    let node = decode_node(r).await?;
    let score = read_compressed_int(r).await?;
    Ok((node, score))
}

/// Runs one `TRAIN_MODEL` job in a freshly spawned child process (`exe`
/// re-invoked with `--run-training-job`), racing `timeout` as a backstop
/// against the child's own internal wall-clock alarm (§4.6: the child races
/// its own timer too, so a delayed signal is not the only thing standing
/// between a runaway factory and the rest of the worker). The slot is
/// released when `_slot` drops, on every exit path.
pub async fn run_training_job(
    _slot: PoolSlot,
    exe: &Path,
    dataset: &Dataset,
    factory: &str,
    transforms: &str,
    timeout: Duration,
) -> Result<TrainOutcome, Error> {
    let mut child = Command::new(exe)
        .arg("--run-training-job")
        .env("CRUCIBLE_TRAIN_TIMEOUT_MS", timeout.as_millis().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut stdout = child.stdout.take().expect("piped stdout");

    let start = Instant::now();
    let run = async {
        write_job(&mut stdin, dataset, factory, transforms).await?;
        drop(stdin); // EOF: tells the child the job is fully written
        let (node, score) = read_result(&mut stdout).await?;
        child.wait().await?;
        Ok::<_, Error>((node, score))
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok((node, score))) => Ok(TrainOutcome {
            node,
            score,
            cpu_time_ms: start.elapsed().as_millis() as i64,
        }),
        Ok(Err(e)) => {
            let _ = child.kill().await;
            Err(e)
        }
        Err(_) => {
            let _ = child.kill().await;
            Err(Error::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{root, Opcode};
    use crate::dataset::{Column, ColumnType};
    use crate::value::Value;
    use std::io::Cursor;

    #[test]
    fn reserve_respects_ceiling_and_releases_on_drop() {
        let pool = WorkerPool::new(2);
        let a = pool.reserve().unwrap();
        let b = pool.reserve().unwrap();
        assert_eq!(pool.num_running(), 2);
        assert!(pool.reserve().is_none());

        drop(a);
        assert_eq!(pool.num_running(), 1);
        let c = pool.reserve().unwrap();
        assert_eq!(pool.num_running(), 2);

        drop(b);
        drop(c);
        assert_eq!(pool.num_running(), 0);
    }

    #[tokio::test]
    async fn job_and_result_round_trip_over_the_wire() {
        let dataset = Dataset::new(
            vec![Column {
                name: "x0".into(),
                kind: ColumnType::Continuous,
            }],
            vec![vec![Value::Float(1.0)]],
        );

        let mut buf = Vec::new();
        write_job(&mut buf, &dataset, "majority", "none").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let (decoded_dataset, factory, transforms) = read_job(&mut cursor).await.unwrap();
        assert_eq!(decoded_dataset.hash, dataset.hash);
        assert_eq!(factory, "majority");
        assert_eq!(transforms, "none");

        let node = root(Node::leaf(Opcode::Category, Value::Category(3)));
        let mut buf = Vec::new();
        write_result(&mut buf, &node, 7).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let (decoded_node, score) = read_result(&mut cursor).await.unwrap();
        assert_eq!(score, 7);
        assert_eq!(
            crate::ast::eval(&decoded_node, &crate::ast::Environment::default()).unwrap(),
            Value::Category(3)
        );
    }
}
