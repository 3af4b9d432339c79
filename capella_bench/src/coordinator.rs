//! The run coordinator.
//!
//! The coordinator owns the lifecycle of a run. It arms the deadline, starts
//! one [`Worker`] per unit of concurrency, waits for every one of them to exit
//! and only then reads the [`Accumulator`]. Worker failures never abort the
//! run; a worker that cannot connect simply contributes nothing.

use std::{
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::gauge;
use rand::{
    SeedableRng,
    rngs::{SmallRng, StdRng},
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    accumulator::{Accumulator, Report},
    config::Config,
    corpus::{self, Corpus},
    transport::{MAX_DATAGRAM_BYTES, Transport},
    worker::Worker,
};

/// Errors produced by [`Coordinator`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The corpus could not be loaded. Fatal, no worker was started.
    #[error(transparent)]
    Corpus(#[from] corpus::Error),
    /// The deadline could not be armed. Fatal, no worker was started.
    #[error(transparent)]
    Signal(#[from] capella_signal::Error),
}

#[derive(Debug)]
/// Drives a single benchmark run.
pub struct Coordinator<T> {
    batch_size: NonZeroU32,
    concurrency: NonZeroU32,
    duration: Duration,
    seed: Option<u64>,
    corpus: Arc<Corpus>,
    transport: Arc<T>,
}

impl<T> Coordinator<T>
where
    T: Transport + 'static,
{
    /// Create a new [`Coordinator`] from an already loaded corpus.
    #[must_use]
    pub fn new(config: &Config, corpus: Corpus, transport: T) -> Self {
        Self {
            batch_size: config.batch_size,
            concurrency: config.concurrency,
            duration: config.duration,
            seed: config.seed,
            corpus: Arc::new(corpus),
            transport: Arc::new(transport),
        }
    }

    /// Create a new [`Coordinator`], loading the corpus named by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corpus`] if the corpus is unavailable. The transport
    /// is not touched in that case.
    pub fn from_config(config: &Config, transport: T) -> Result<Self, Error> {
        let corpus = Corpus::load(&config.metrics_path)?;
        info!(
            "loaded {} metric lines from {}",
            corpus.len(),
            config.metrics_path.display()
        );
        Ok(Self::new(config, corpus, transport))
    }

    /// Run every worker until the deadline and report on the run.
    ///
    /// Returns only once every worker has exited and the deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signal`] if the deadline timer cannot be started.
    pub async fn run(self) -> Result<Report, Error> {
        let largest_batch =
            (self.corpus.longest_line() + 1).saturating_mul(self.batch_size.get() as usize);
        if largest_batch > MAX_DATAGRAM_BYTES {
            warn!(
                "batches of {} lines may reach {largest_batch} bytes, over the {MAX_DATAGRAM_BYTES} byte UDP limit; oversized batches will fail to transmit",
                self.batch_size
            );
        }

        let mut root_rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let accumulator = Accumulator::new();

        let (deadline_watcher, deadline_broadcast) = capella_signal::signal();
        let start = Instant::now();
        deadline_broadcast.signal_at(start + self.duration)?;

        info!(
            "starting {} workers against {} for {:?}, batch size {}",
            self.concurrency,
            self.transport.endpoint(),
            self.duration,
            self.batch_size,
        );
        let mut workers = JoinSet::new();
        for id in 0..self.concurrency.get() as usize {
            let worker = Worker::new(
                id,
                Arc::clone(&self.transport),
                Arc::clone(&self.corpus),
                accumulator.clone(),
                self.batch_size,
                SmallRng::from_rng(&mut root_rng),
                deadline_watcher.clone(),
            );
            workers.spawn(worker.spin());
        }
        gauge!("workers_running").set(f64::from(self.concurrency.get()));

        let mut per_worker = Vec::with_capacity(self.concurrency.get() as usize);
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(generated) => per_worker.push(generated),
                Err(err) => error!("Could not join the spawned worker task: {err}"),
            }
            gauge!("workers_running").decrement(1.0);
        }

        // Workers that failed to connect exit early. The run still spans the
        // configured duration, which is the divisor of the reported rate.
        deadline_watcher.recv().await;

        let total = accumulator.total();
        let joined: u64 = per_worker.iter().sum();
        if joined == total {
            debug!("per-worker counts agree with the accumulator: {total}");
        } else {
            warn!("per-worker counts sum to {joined}, accumulator holds {total}");
        }
        info!(
            "run complete after {:?}, {total} metrics generated",
            start.elapsed()
        );

        Ok(Report {
            total,
            duration: self.duration,
            per_worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        io::Write,
        sync::{Arc, Mutex, atomic::Ordering},
    };

    use tokio::net::UdpSocket;

    use super::*;
    use crate::transport::{
        Udp,
        test::{Recording, Unreachable},
    };

    fn config(batch_size: u32, concurrency: u32, duration: Duration) -> Config {
        Config {
            batch_size: NonZeroU32::new(batch_size).expect("non-zero batch"),
            concurrency: NonZeroU32::new(concurrency).expect("non-zero concurrency"),
            duration,
            seed: Some(1),
            ..Config::default()
        }
    }

    fn two_line_corpus() -> Corpus {
        Corpus::from_lines(["a:1|c", "b:2|c"]).expect("valid corpus")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_worker_batches_of_two() {
        let transport = Recording::default();
        let datagrams = Arc::clone(&transport.datagrams);
        let cfg = config(2, 1, Duration::from_millis(100));

        let report = Coordinator::new(&cfg, two_line_corpus(), transport)
            .run()
            .await
            .expect("run failed");

        let datagrams = datagrams.lock().expect("poisoned");
        assert!(!datagrams.is_empty());
        for datagram in datagrams.iter() {
            let text = std::str::from_utf8(datagram).expect("utf8 payload");
            let lines: Vec<&str> = text.lines().collect();
            assert_eq!(lines.len(), 2, "datagram {text:?}");
            assert!(lines.iter().all(|l| *l == "a:1|c" || *l == "b:2|c"));
        }
        assert!(report.total >= datagrams.len() as u64 * 2);
        assert_eq!(report.per_worker, vec![report.total]);
        assert_eq!(report.duration, Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn all_connections_failing_still_reaches_deadline() {
        let transport = Unreachable::default();
        let connects = Arc::clone(&transport.connects);
        let duration = Duration::from_millis(100);
        let cfg = config(10, 4, duration);

        let start = Instant::now();
        let report = Coordinator::new(&cfg, two_line_corpus(), transport)
            .run()
            .await
            .expect("run failed");
        let elapsed = start.elapsed();

        assert!(elapsed >= duration, "returned after {elapsed:?}");
        assert!(elapsed < duration + Duration::from_secs(2));
        assert_eq!(connects.load(Ordering::SeqCst), 4);
        assert_eq!(report.total, 0);
        assert_eq!(report.per_worker, vec![0, 0, 0, 0]);
        assert!(report.per_second().abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn many_workers_stop_near_the_deadline_and_account_exactly() {
        let transport = Recording::default();
        let connects = Arc::clone(&transport.connects);
        let duration = Duration::from_millis(200);
        let cfg = config(5, 32, duration);

        let start = Instant::now();
        let report = Coordinator::new(&cfg, two_line_corpus(), transport)
            .run()
            .await
            .expect("run failed");
        let elapsed = start.elapsed();

        assert!(elapsed >= duration);
        assert!(elapsed < duration + Duration::from_secs(2), "overran: {elapsed:?}");
        assert_eq!(connects.load(Ordering::SeqCst), 32);
        assert_eq!(report.per_worker.len(), 32);
        assert_eq!(report.per_worker.iter().sum::<u64>(), report.total);
        assert!(report.total > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blank_corpus_fails_before_any_connection() {
        let mut file = tempfile::NamedTempFile::new().expect("could not create temp file");
        write!(file, "\n\n\n").expect("write failed");

        let transport = Recording::default();
        let connects = Arc::clone(&transport.connects);
        let cfg = Config {
            metrics_path: file.path().to_path_buf(),
            ..config(2, 4, Duration::from_millis(100))
        };

        let err = Coordinator::from_config(&cfg, transport).expect_err("blank corpus must fail");
        assert!(matches!(err, Error::Corpus(corpus::Error::Empty { .. })));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn seeded_runs_draw_the_same_first_batch() {
        let corpus: Vec<String> = (0..64).map(|i| format!("metric.{i}:1|c")).collect();
        let cfg = config(8, 1, Duration::from_millis(20));

        let mut firsts = Vec::new();
        for _ in 0..2 {
            let transport = Recording::default();
            let datagrams = Arc::clone(&transport.datagrams);
            Coordinator::new(
                &cfg,
                Corpus::from_lines(&corpus).expect("valid corpus"),
                transport,
            )
            .run()
            .await
            .expect("run failed");
            let first = datagrams
                .lock()
                .expect("poisoned")
                .first()
                .cloned()
                .expect("at least one datagram");
            firsts.push(first);
        }
        assert_eq!(firsts[0], firsts[1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn udp_end_to_end() {
        let receiver = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("could not bind receiver");
        let addr = receiver.local_addr().expect("receiver has no address");

        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = Arc::clone(&received);
        let blackhole = tokio::spawn(async move {
            let mut buf = vec![0; MAX_DATAGRAM_BYTES];
            while let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(500), receiver.recv(&mut buf)).await
            {
                sink.lock().expect("poisoned").push(buf[..n].to_vec());
            }
        });

        let cfg = Config {
            addr: addr.to_string(),
            ..config(4, 2, Duration::from_millis(100))
        };
        let corpus = two_line_corpus();
        let report = Coordinator::new(&cfg, corpus, Udp::new(cfg.addr.clone()))
            .run()
            .await
            .expect("run failed");
        blackhole.await.expect("blackhole panicked");

        let received = received.lock().expect("poisoned");
        // Loopback UDP may still drop under load; require only that traffic
        // arrived and that every datagram is well formed.
        assert!(!received.is_empty());
        let allowed: HashSet<&str> = ["a:1|c", "b:2|c"].into_iter().collect();
        for datagram in received.iter() {
            let text = std::str::from_utf8(datagram).expect("utf8 payload");
            let lines: Vec<&str> = text.lines().collect();
            assert_eq!(lines.len(), 4);
            assert!(lines.iter().all(|l| allowed.contains(l)));
        }
        assert!(report.total >= received.len() as u64 * 4);
    }
}
