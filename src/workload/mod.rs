//! Benchmark worker surface
//!
//! The workload generator, thread launcher, and throughput reporter
//! live outside the engine. The engine's side of the contract is one
//! execution handle per worker, a parameter stream consumed one
//! transaction at a time, and commit/abort counters with start/end
//! timestamps readable through plain accessors.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::txn::executor::{Execution, TxFinalStatus};

/// One benchmark worker: an execution handle plus its run statistics
pub struct Worker {
    exec: Execution,
    commit_count: u64,
    abort_count: u64,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl Worker {
    pub fn new(exec: Execution) -> Self {
        Self {
            exec,
            commit_count: 0,
            abort_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Drain a parameter stream, one transaction per item
    ///
    /// The body owns the whole transaction: begin, reads and writes,
    /// commit. The worker tallies the terminal status of each.
    pub fn run<P, F>(&mut self, params: impl IntoIterator<Item = P>, mut body: F) -> Result<()>
    where
        F: FnMut(&mut Execution, P) -> Result<TxFinalStatus>,
    {
        self.started_at = Some(Instant::now());
        for param in params {
            match body(&mut self.exec, param)? {
                TxFinalStatus::Committed => self.commit_count += 1,
                TxFinalStatus::Aborted => self.abort_count += 1,
            }
        }
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    pub fn commits(&self) -> u64 {
        self.commit_count
    }

    pub fn aborts(&self) -> u64 {
        self.abort_count
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    /// Wall-clock duration of the run, once finished
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    pub fn execution_mut(&mut self) -> &mut Execution {
        &mut self.exec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::txn::version_db::VersionDb;
    use rand::Rng;

    #[test]
    fn test_worker_counts_outcomes() {
        let db = VersionDb::new(EngineConfig::for_testing());
        db.create_version_table("t");

        let mut worker = Worker::new(Execution::new(db.clone()));
        worker
            .run(0..10u64, |exec, i| {
                exec.begin();
                let key = format!("k{}", i).into_bytes();
                exec.insert("t", &key, i.to_le_bytes().to_vec())?;
                if i % 3 == 0 {
                    return exec.abort();
                }
                exec.commit()
            })
            .unwrap();

        assert_eq!(worker.commits(), 6);
        assert_eq!(worker.aborts(), 4);
        assert!(worker.elapsed().is_some());
    }

    #[test]
    fn test_workers_share_one_database() {
        let db = VersionDb::new(EngineConfig::for_testing());
        db.create_version_table("t");

        // Seed a handful of records
        let mut seed = Execution::new(db.clone());
        seed.begin();
        for i in 0..8u8 {
            seed.insert("t", &vec![i], vec![0]).unwrap();
        }
        assert_eq!(seed.commit().unwrap(), TxFinalStatus::Committed);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut worker = Worker::new(Execution::new(db));
                worker
                    .run(0..50u32, |exec, _| {
                        exec.begin();
                        let key = vec![rng.gen_range(0..8u8)];
                        if exec.read("t", &key)?.is_some() {
                            exec.write("t", &key, vec![1])?;
                        }
                        exec.commit()
                    })
                    .unwrap();
                (worker.commits(), worker.aborts())
            }));
        }

        let mut commits = 0;
        let mut total = 0;
        for handle in handles {
            let (c, a) = handle.join().unwrap();
            commits += c;
            total += c + a;
        }
        assert_eq!(total, 200);
        assert!(commits > 0);
    }
}
