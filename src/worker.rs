//! The measurement worker pool.
//!
//! Spawns `threads` scoped worker threads, each with its own control
//! connection, and round-robins relay pairs across them. All workers
//! share one RTT cache and one stream-attachment mutex: the mutex
//! exists because attaching a just-opened SOCKS stream onto the right
//! circuit depends on the daemon reporting exactly one pending `NEW`
//! stream at a time, which only holds if no two workers dial through
//! the same control connection's attach window concurrently. Since
//! each worker owns its own control connection that constraint is
//! already met per-connection; the mutex here additionally keeps the
//! dispatch loop simple to reason about under a shared cache.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;
use crossbeam_utils::thread as scoped_thread;
use log::{info, warn};
use crate::cache::RttCache;
use crate::controller::Controller;
use crate::engine::{self, EngineConfig};
use crate::error::Failed;
use crate::fingerprint::Pair;
use crate::results::RawResult;
use crate::utils::sync::Mutex;

/// Distributes pairs across a fixed pool of worker threads, each
/// driving its own control connection.
pub struct WorkerPool {
    ctrl_port: u16,
    build_timeout: Duration,
    threads: usize,
}

impl WorkerPool {
    pub fn new(ctrl_port: u16, build_timeout: Duration, threads: usize) -> Self {
        WorkerPool { ctrl_port, build_timeout, threads: threads.max(1) }
    }

    /// Runs every pair in `pairs` to completion, sending each raw
    /// result to `results_tx` as it finishes, then returns once all
    /// pairs have been dispatched and every worker has drained.
    ///
    /// Blocks the calling thread for the whole run; the results
    /// manager is expected to be draining `results_tx`'s receiver on
    /// another thread.
    pub fn run(
        &self,
        pairs: Vec<Pair>,
        cache: &RttCache,
        config: &EngineConfig,
        results_tx: SyncSender<RawResult>,
    ) -> Result<(), Failed> {
        let attach_mutex = Mutex::new(());
        let total = pairs.len();
        info!("Dispatching {} pairs across {} worker threads.", total, self.threads);

        scoped_thread::scope(|scope| {
            let mut inputs = Vec::with_capacity(self.threads);
            for worker_id in 0..self.threads {
                let (tx, rx) = sync_channel::<Pair>(1);
                inputs.push(tx);
                let results_tx = results_tx.clone();
                let attach_mutex = &attach_mutex;
                let ctrl_port = self.ctrl_port;
                let build_timeout = self.build_timeout;
                scope.spawn(move |_| {
                    worker_loop(worker_id, ctrl_port, build_timeout, rx, attach_mutex, cache, config, results_tx);
                });
            }
            dispatch(pairs, inputs);
        }).map_err(|_| {
            warn!("A worker thread panicked; measurement run aborted.");
            Failed
        })?;

        info!("All {} pairs dispatched and drained.", total);
        Ok(())
    }
}

/// Polls the workers in order, assigning each pair to the first worker
/// whose inbox isn't full, skipping busy ones rather than blocking on
/// them. Sleeps briefly only once a full round finds nobody free.
fn dispatch(pairs: Vec<Pair>, inputs: Vec<SyncSender<Pair>>) {
    let mut pairs = pairs.into_iter();
    let mut pending: Option<Pair> = None;
    loop {
        let mut pair = match pending.take().or_else(|| pairs.next()) {
            Some(pair) => pair,
            None => break,
        };
        let mut sent = false;
        for input in &inputs {
            match input.try_send(pair) {
                Ok(()) => {
                    sent = true;
                    break
                }
                Err(TrySendError::Full(p)) | Err(TrySendError::Disconnected(p)) => {
                    pair = p;
                }
            }
        }
        if sent {
            continue
        }
        pending = Some(pair);
        thread::sleep(Duration::from_millis(500));
    }
    // Dropping `inputs` closes every worker's channel, ending its loop.
}

fn worker_loop(
    worker_id: usize,
    ctrl_port: u16,
    build_timeout: Duration,
    rx: Receiver<Pair>,
    attach_mutex: &Mutex<()>,
    cache: &RttCache,
    config: &EngineConfig,
    results_tx: SyncSender<RawResult>,
) {
    let controller = match Controller::connect(ctrl_port, build_timeout) {
        Ok(controller) => controller,
        Err(_) => {
            warn!("Worker {} could not connect to the control port; exiting.", worker_id);
            return
        }
    };
    for pair in rx {
        let raw = engine::measure_pair(
            &controller, cache, attach_mutex, config, pair.first(), pair.second()
        );
        if results_tx.send(raw).is_err() {
            warn!("Worker {} could not hand off a result; results manager gone.", worker_id);
            break
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fp(c: char) -> crate::fingerprint::Fingerprint {
        c.to_string().repeat(40).parse().unwrap()
    }

    #[test]
    fn dispatch_drains_all_pairs_round_robin() {
        let (tx0, rx0) = sync_channel::<Pair>(4);
        let (tx1, rx1) = sync_channel::<Pair>(4);
        let pairs = vec![
            Pair::new(fp('A'), fp('B')),
            Pair::new(fp('C'), fp('D')),
            Pair::new(fp('E'), fp('F')),
        ];
        dispatch(pairs, vec![tx0, tx1]);
        let mut total = 0;
        while let Ok(_) = rx0.try_recv() { total += 1; }
        while let Ok(_) = rx1.try_recv() { total += 1; }
        assert_eq!(total, 3);
    }

    #[test]
    fn busy_worker_is_skipped_in_favour_of_a_free_one() {
        // Worker 0's inbox is pre-filled so it's full from the start;
        // every pair should land on worker 1 instead of dispatch
        // blocking on worker 0.
        let (tx0, _rx0) = sync_channel::<Pair>(1);
        tx0.send(Pair::new(fp('Z'), fp('Y'))).unwrap();
        let (tx1, rx1) = sync_channel::<Pair>(4);
        let pairs = vec![
            Pair::new(fp('A'), fp('B')),
            Pair::new(fp('C'), fp('D')),
        ];
        dispatch(pairs, vec![tx0, tx1]);
        let mut total = 0;
        while let Ok(_) = rx1.try_recv() { total += 1; }
        assert_eq!(total, 2);
    }
}
