//! Exercises the shared instance from many threads at once and checks that
//! every one of them got the same object.
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{PoisonError, RwLock};
use std::thread;

use miette::Diagnostic;

use thiserror::Error;

use crate::config::ProbeConfig;
use crate::instance::{InstanceHolder, InstanceId, State};

/// Smallest number of workers that can race each other
pub const MIN_THREADS: usize = 2;

/// Upper bound on `threads * calls`, the number of observations kept in memory
pub const MAX_OBSERVATIONS: usize = 1 << 20;

type Worker = fn(usize, usize) -> Vec<Observation>;

/// How the probe workers are run
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    clap::ValueEnum,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// One OS thread per worker, all released at the same time
    #[default]
    Spawn,
    /// A dedicated rayon pool with one thread per worker, all released at the same time
    Pool,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn => f.write_str("spawn"),
            Self::Pool => f.write_str("pool"),
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum ProbeError {
    #[error("a probe needs at least 2 threads, got {0}")]
    #[diagnostic(
        code("singleton::too-few-threads"),
        help("a single thread cannot race anyone, use `--threads 2` or more")
    )]
    TooFewThreads(usize),

    #[error("a probe needs at least one call per thread")]
    #[diagnostic(code("singleton::no-calls"))]
    NoCalls,

    #[error(
        "{threads} threads making {calls} calls each is more than {max} observations",
        max = MAX_OBSERVATIONS
    )]
    #[diagnostic(
        code("singleton::too-many-observations"),
        help("lower `--threads` or `--calls`")
    )]
    TooManyObservations { threads: usize, calls: usize },

    #[error("could not spawn a probe thread")]
    #[diagnostic(code("singleton::spawn"))]
    Spawn(#[from] std::io::Error),

    #[error("could not build the probe thread pool")]
    #[diagnostic(code("singleton::pool"))]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("probe thread {0} panicked")]
    #[diagnostic(code("singleton::worker-panicked"))]
    WorkerPanicked(usize),

    #[error("the probe did not record any observation")]
    #[diagnostic(code("singleton::empty"))]
    Empty,

    #[error("thread {thread} got instance {found} on call {call}, expected {expected}")]
    #[diagnostic(
        code("singleton::identity-mismatch"),
        help("more than one instance is reachable from the holder")
    )]
    IdentityMismatch {
        thread: usize,
        call: usize,
        expected: InstanceId,
        found: InstanceId,
    },

    #[error("the shared instance was built {0} times")]
    #[diagnostic(code("singleton::multiple-constructions"))]
    MultipleConstructions(usize),
}

/// One call to the holder made by a probe worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Observation {
    pub thread: usize,
    pub call: usize,
    pub instance: InstanceId,
}

/// Runs workers that each fetch the shared instance a number of times
#[derive(Debug, Clone)]
pub struct Probe {
    threads: usize,
    calls: usize,
    strategy: Strategy,
    worker: Worker,
}

impl Probe {
    pub fn new(threads: usize, calls: usize) -> Result<Self, ProbeError> {
        if threads < MIN_THREADS {
            return Err(ProbeError::TooFewThreads(threads));
        }
        if calls == 0 {
            return Err(ProbeError::NoCalls);
        }
        if !threads
            .checked_mul(calls)
            .is_some_and(|observations| observations <= MAX_OBSERVATIONS)
        {
            return Err(ProbeError::TooManyObservations { threads, calls });
        }

        Ok(Self {
            threads,
            calls,
            strategy: Strategy::default(),
            worker: observe,
        })
    }

    pub fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        Ok(Self::new(config.threads(), config.calls())?.with_strategy(config.strategy()))
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Runs every worker to completion and collects what they saw
    ///
    /// # Example
    ///
    /// ```
    /// use singleton::probe::Probe;
    ///
    /// let report = Probe::new(4, 2)?.run()?;
    /// assert_eq!(report.observations().len(), 8);
    /// assert_eq!(report.verify()?, singleton::instance().id());
    /// # Ok::<(), singleton::probe::ProbeError>(())
    /// ```
    pub fn run(&self) -> Result<Report, ProbeError> {
        log::info!(
            "probing with {} {} workers, {} calls each",
            self.threads,
            self.strategy,
            self.calls
        );

        let observations = match self.strategy {
            Strategy::Spawn => self.run_spawned()?,
            Strategy::Pool => self.run_pooled()?,
        };

        let constructed_on = match InstanceHolder::state() {
            State::Initialized => Some(format!(
                "{:?}",
                InstanceHolder::get_instance().constructed_on()
            )),
            State::Uninitialized => None,
        };
        let report = Report {
            strategy: self.strategy,
            threads: self.threads,
            calls_per_thread: self.calls,
            constructions: InstanceHolder::constructions(),
            instance: observations.first().map(|observation| observation.instance),
            constructed_on,
            observations,
        };
        log::info!(
            "probe finished with {} observations and {} distinct identities",
            report.observations.len(),
            report.distinct()
        );

        Ok(report)
    }

    fn run_spawned(&self) -> Result<Vec<Observation>, ProbeError> {
        // Workers wait on the read side until every one of them is spawned.
        let gate = RwLock::new(());
        let calls = self.calls;
        let worker = self.worker;

        thread::scope(|scope| -> Result<Vec<Observation>, ProbeError> {
            let start = gate.write().unwrap_or_else(PoisonError::into_inner);
            let spawned = (0..self.threads)
                .map(|index| {
                    let gate = &gate;
                    thread::Builder::new()
                        .name(format!("probe-{index}"))
                        .spawn_scoped(scope, move || {
                            drop(gate.read().unwrap_or_else(PoisonError::into_inner));
                            worker(index, calls)
                        })
                })
                .collect::<Result<Vec<_>, _>>();
            drop(start);

            let results = spawned?
                .into_iter()
                .map(thread::ScopedJoinHandle::join)
                .collect::<Vec<_>>();

            let mut observations = Vec::with_capacity(self.threads * calls);
            for (index, result) in results.into_iter().enumerate() {
                let batch = result.map_err(|_| ProbeError::WorkerPanicked(index))?;
                observations.extend(batch);
            }

            Ok(observations)
        })
    }

    fn run_pooled(&self) -> Result<Vec<Observation>, ProbeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|index| format!("probe-pool-{index}"))
            .build()?;
        let gate = RwLock::new(());
        let calls = self.calls;
        let worker = self.worker;

        let mut results = (0..self.threads)
            .map(|_| None)
            .collect::<Vec<Option<thread::Result<Vec<Observation>>>>>();
        let slots = results.iter_mut();
        pool.scope(|scope| {
            // The write guard is not `Send`, it has to be taken inside the scope.
            let start = gate.write().unwrap_or_else(PoisonError::into_inner);
            for (index, slot) in slots.enumerate() {
                let gate = &gate;
                scope.spawn(move |_| {
                    *slot = Some(catch_unwind(AssertUnwindSafe(|| {
                        drop(gate.read().unwrap_or_else(PoisonError::into_inner));
                        worker(index, calls)
                    })));
                });
            }
            drop(start);
        });

        let mut observations = Vec::with_capacity(self.threads * calls);
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(batch)) => observations.extend(batch),
                Some(Err(_)) | None => return Err(ProbeError::WorkerPanicked(index)),
            }
        }

        Ok(observations)
    }
}

fn observe(thread: usize, calls: usize) -> Vec<Observation> {
    let mut scratch = thread as u64;

    (0..calls)
        .map(|call| {
            if call > 0 {
                scratch = churn(scratch);
            }
            let instance = InstanceHolder::get_instance().id();
            log::trace!("thread {thread} call {call} got {instance}");

            Observation {
                thread,
                call,
                instance,
            }
        })
        .collect()
}

/// Unrelated work done between two calls to the holder
fn churn(seed: u64) -> u64 {
    let values = (0..64u32)
        .map(|shift| seed.rotate_left(shift) ^ u64::from(shift))
        .collect::<Vec<_>>();

    std::hint::black_box(values.iter().fold(seed, |acc, value| acc.wrapping_add(*value)))
}

/// What a [`Probe`] saw
#[derive(Debug, Clone, serde::Serialize)]
pub struct Report {
    strategy: Strategy,
    threads: usize,
    calls_per_thread: usize,
    constructions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance: Option<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    constructed_on: Option<String>,
    observations: Vec<Observation>,
}

impl Report {
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn calls_per_thread(&self) -> usize {
        self.calls_per_thread
    }

    /// Number of times the instance had been built when the probe finished
    pub fn constructions(&self) -> usize {
        self.constructions
    }

    /// Identity seen by the first observation
    pub fn instance(&self) -> Option<InstanceId> {
        self.instance
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Number of distinct identities seen across all observations
    pub fn distinct(&self) -> usize {
        self.observations
            .iter()
            .map(|observation| observation.instance)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Checks that every observation saw the same instance and that it was built once
    pub fn verify(&self) -> Result<InstanceId, ProbeError> {
        let expected = self
            .observations
            .first()
            .map(|observation| observation.instance)
            .ok_or(ProbeError::Empty)?;

        if let Some(odd) = self
            .observations
            .iter()
            .find(|observation| observation.instance != expected)
        {
            return Err(ProbeError::IdentityMismatch {
                thread: odd.thread,
                call: odd.call,
                expected,
                found: odd.instance,
            });
        }

        if self.constructions != 1 {
            return Err(ProbeError::MultipleConstructions(self.constructions));
        }

        Ok(expected)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "strategy: {}", self.strategy)?;
        writeln!(f, "threads: {}", self.threads)?;
        writeln!(f, "calls per thread: {}", self.calls_per_thread)?;
        writeln!(f, "observations: {}", self.observations.len())?;
        writeln!(f, "distinct identities: {}", self.distinct())?;
        writeln!(f, "constructions: {}", self.constructions)?;
        if let Some(instance) = self.instance {
            writeln!(f, "instance: {instance}")?;
        }
        if let Some(constructed_on) = &self.constructed_on {
            writeln!(f, "constructed on: {constructed_on}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(constructions: usize, observations: Vec<Observation>) -> Report {
        Report {
            strategy: Strategy::Spawn,
            threads: 2,
            calls_per_thread: 1,
            constructions,
            instance: observations.first().map(|observation| observation.instance),
            constructed_on: None,
            observations,
        }
    }

    #[test]
    fn rejects_too_few_threads() {
        assert!(matches!(
            Probe::new(1, 3),
            Err(ProbeError::TooFewThreads(1))
        ));
        assert!(matches!(Probe::new(0, 3), Err(ProbeError::TooFewThreads(0))));
    }

    #[test]
    fn rejects_zero_calls() {
        assert!(matches!(Probe::new(4, 0), Err(ProbeError::NoCalls)));
    }

    #[test]
    fn rejects_too_many_observations() {
        assert!(matches!(
            Probe::new(4, usize::MAX / 2),
            Err(ProbeError::TooManyObservations {
                threads: 4,
                calls
            }) if calls == usize::MAX / 2
        ));
        assert!(matches!(
            Probe::new(2, MAX_OBSERVATIONS),
            Err(ProbeError::TooManyObservations { .. })
        ));
        assert!(Probe::new(2, MAX_OBSERVATIONS / 2).is_ok());
    }

    fn gives_up_on_second_thread(thread: usize, calls: usize) -> Vec<Observation> {
        if thread == 1 {
            panic!("thread {thread} gave up");
        }
        observe(thread, calls)
    }

    #[test]
    fn spawned_worker_panic_is_reported() {
        let mut probe = Probe::new(4, 2).unwrap();
        probe.worker = gives_up_on_second_thread;

        assert!(matches!(probe.run(), Err(ProbeError::WorkerPanicked(1))));
    }

    #[test]
    fn pooled_worker_panic_is_reported() {
        let mut probe = Probe::new(4, 2).unwrap().with_strategy(Strategy::Pool);
        probe.worker = gives_up_on_second_thread;

        assert!(matches!(probe.run(), Err(ProbeError::WorkerPanicked(1))));
    }

    #[test]
    fn pooled_workers_run_at_the_same_time() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        use std::time::{Duration, Instant};

        static ARRIVED: AtomicUsize = AtomicUsize::new(0);
        static GAVE_UP: AtomicBool = AtomicBool::new(false);
        fn wait_for_everyone(thread: usize, calls: usize) -> Vec<Observation> {
            ARRIVED.fetch_add(1, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(10);
            while ARRIVED.load(Ordering::SeqCst) < 4 {
                if Instant::now() > deadline {
                    GAVE_UP.store(true, Ordering::SeqCst);
                    break;
                }
                std::thread::yield_now();
            }
            observe(thread, calls)
        }

        let mut probe = Probe::new(4, 1).unwrap().with_strategy(Strategy::Pool);
        probe.worker = wait_for_everyone;

        let report = probe.run().unwrap();
        assert_eq!(report.observations().len(), 4);
        assert!(!GAVE_UP.load(Ordering::SeqCst));
    }

    #[test]
    fn spawned_probe_sees_one_instance() {
        let report = Probe::new(10, 3).unwrap().run().unwrap();

        assert_eq!(report.observations().len(), 30);
        assert_eq!(report.distinct(), 1);
        assert_eq!(report.constructions(), 1);
        assert_eq!(report.verify().unwrap(), crate::instance().id());
    }

    #[test]
    fn pooled_probe_sees_one_instance() {
        let report = Probe::new(6, 4)
            .unwrap()
            .with_strategy(Strategy::Pool)
            .run()
            .unwrap();

        assert_eq!(report.strategy(), Strategy::Pool);
        assert_eq!(report.observations().len(), 24);
        assert_eq!(report.verify().unwrap(), crate::instance().id());
    }

    #[test]
    fn every_worker_reports_every_call() {
        let report = Probe::new(3, 2).unwrap().run().unwrap();

        let mut seen = report
            .observations()
            .iter()
            .map(|observation| (observation.thread, observation.call))
            .collect::<Vec<_>>();
        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
    }

    #[test]
    fn verify_flags_mismatch() {
        let expected = InstanceId(0x1000);
        let found = InstanceId(0x2000);
        let report = report(
            1,
            vec![
                Observation {
                    thread: 0,
                    call: 0,
                    instance: expected,
                },
                Observation {
                    thread: 1,
                    call: 0,
                    instance: found,
                },
            ],
        );

        assert_eq!(report.distinct(), 2);
        match report.verify() {
            Err(ProbeError::IdentityMismatch {
                thread,
                call,
                expected: e,
                found: f,
            }) => {
                assert_eq!((thread, call), (1, 0));
                assert_eq!(e, expected);
                assert_eq!(f, found);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn verify_flags_extra_constructions() {
        let instance = InstanceId(0x1000);
        let report = report(
            2,
            vec![Observation {
                thread: 0,
                call: 0,
                instance,
            }],
        );

        assert!(matches!(
            report.verify(),
            Err(ProbeError::MultipleConstructions(2))
        ));
    }

    #[test]
    fn verify_flags_empty_report() {
        assert!(matches!(report(1, vec![]).verify(), Err(ProbeError::Empty)));
    }

    #[test]
    fn display_lists_counts() {
        let report = Probe::new(2, 1).unwrap().run().unwrap();
        let rendered = report.to_string();

        assert!(rendered.contains("threads: 2\n"));
        assert!(rendered.contains("observations: 2\n"));
        assert!(rendered.contains("distinct identities: 1\n"));
        assert!(rendered.contains(&format!("instance: {}\n", crate::instance().id())));
    }

    #[test]
    fn from_config_uses_defaults() {
        let probe = Probe::from_config(&ProbeConfig::default()).unwrap();

        assert_eq!(probe.threads, 10);
        assert_eq!(probe.calls, 3);
        assert_eq!(probe.strategy, Strategy::Spawn);
    }
}
