use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use anyhow::Result;

use crate::engine::{ContinuousBatchingPipeline, PipelineMetrics};

/// Number of steps between two metric log lines.
pub const METRICS_LOG_INTERVAL: usize = 1000;

/// Work driven by an [`Executor`].
pub trait WorkSource: Send + Sync + 'static {
    fn has_work(&self) -> bool;
    /// One unit of progress. An error is fatal for the executor.
    fn run_once(&self) -> Result<()>;
    fn log_metrics(&self) {}
}

pub type FatalHandler = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Logs and terminates the process. An engine that failed mid-step is in an unknown state.
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|err: &anyhow::Error| {
        log::error!("[executor][fatal] {err:#}");
        std::process::exit(1);
    })
}

#[derive(Debug, Default)]
struct Signal {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl Signal {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let _guard = self.lock();
        self.wake.notify_one();
    }

    fn shutdown(&self) {
        let mut shutdown = self.lock();
        *shutdown = true;
        self.wake.notify_all();
    }
}

pub struct Executor<W: WorkSource> {
    source: Arc<W>,
    signal: Arc<Signal>,
    fatal: FatalHandler,
}

impl<W: WorkSource> Executor<W> {
    fn run(self) {
        let mut steps = 0usize;
        loop {
            {
                let guard = self.signal.lock();
                let shutdown = self
                    .signal
                    .wake
                    .wait_while(guard, |shutdown| !*shutdown && !self.source.has_work())
                    .unwrap_or_else(PoisonError::into_inner);
                if *shutdown {
                    break;
                }
            }

            if let Err(err) = self.source.run_once() {
                (self.fatal)(&err);
                log::error!("[executor][halt] worker stopped after fatal error");
                return;
            }

            steps += 1;
            if steps % METRICS_LOG_INTERVAL == 0 || !self.source.has_work() {
                self.source.log_metrics();
            }
        }
        log::info!("[executor][exit] steps: {steps}");
    }
}

/// Owns the worker thread of an [`Executor`]. Dropping it shuts the worker down.
pub struct ExecutorWrapper {
    signal: Arc<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl ExecutorWrapper {
    pub fn spawn<W: WorkSource>(name: &str, source: Arc<W>) -> Result<Self> {
        Self::spawn_with_fatal_handler(name, source, exit_on_fatal())
    }

    pub fn spawn_with_fatal_handler<W: WorkSource>(
        name: &str,
        source: Arc<W>,
        fatal: FatalHandler,
    ) -> Result<Self> {
        let signal = Arc::new(Signal::default());
        let executor = Executor {
            source,
            signal: signal.clone(),
            fatal,
        };
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || executor.run())?;
        log::info!("[executor][start] {name}");
        Ok(Self {
            signal,
            worker: Some(worker),
        })
    }

    /// Wakes the worker. Must be called after new work was made visible to the source.
    pub fn notify(&self) {
        self.signal.notify();
    }
}

impl Drop for ExecutorWrapper {
    fn drop(&mut self) {
        self.signal.shutdown();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[executor][join] worker panicked");
            }
        }
    }
}

/// Drives a shared continuous-batching pipeline.
pub struct PipelineWork {
    pipeline: Arc<dyn ContinuousBatchingPipeline>,
    /// The KV cache grows on demand (`cache_size = 0`), so there is no capacity to report against.
    is_dynamic_kv_cache: bool,
}

impl PipelineWork {
    pub fn new(pipeline: Arc<dyn ContinuousBatchingPipeline>, is_dynamic_kv_cache: bool) -> Self {
        Self {
            pipeline,
            is_dynamic_kv_cache,
        }
    }

    fn metrics_line(&self, metrics: &PipelineMetrics) -> String {
        let cache = match self.is_dynamic_kv_cache {
            true => format!("cache usage {} bytes", metrics.kv_cache_usage_bytes),
            false => format!("cache usage {:.1}%", metrics.cache_usage),
        };
        format!(
            "all requests: {}; scheduled requests: {}; {cache}",
            metrics.requests, metrics.scheduled_requests
        )
    }
}

impl WorkSource for PipelineWork {
    fn has_work(&self) -> bool {
        self.pipeline.has_non_finished_requests()
    }

    fn run_once(&self) -> Result<()> {
        self.pipeline.step()
    }

    fn log_metrics(&self) {
        let metrics = self.pipeline.metrics();
        log::info!("[executor][metrics] {}", self.metrics_line(&metrics));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use super::*;

    #[derive(Default)]
    struct Countdown {
        remaining: AtomicUsize,
        steps: AtomicUsize,
        fail: AtomicBool,
    }

    impl WorkSource for Countdown {
        fn has_work(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) > 0
        }

        fn run_once(&self) -> Result<()> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("device lost");
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_idle_executor_does_not_step() {
        let source = Arc::new(Countdown::default());
        let wrapper = ExecutorWrapper::spawn("test-idle", source.clone()).expect("test");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(source.steps.load(Ordering::SeqCst), 0);
        drop(wrapper);
    }

    #[test]
    fn test_notify_drives_work_to_completion() {
        let source = Arc::new(Countdown::default());
        let wrapper = ExecutorWrapper::spawn("test-drive", source.clone()).expect("test");
        source.remaining.store(3, Ordering::SeqCst);
        wrapper.notify();
        wait_until(|| source.remaining.load(Ordering::SeqCst) == 0);
        assert_eq!(source.steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_shutdown_joins_idle_worker() {
        let source = Arc::new(Countdown::default());
        let wrapper = ExecutorWrapper::spawn("test-shutdown", source).expect("test");
        let start = Instant::now();
        drop(wrapper);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_fatal_error_stops_stepping() {
        let source = Arc::new(Countdown::default());
        source.fail.store(true, Ordering::SeqCst);
        let fatal_calls = Arc::new(AtomicUsize::new(0));
        let counter = fatal_calls.clone();
        let wrapper = ExecutorWrapper::spawn_with_fatal_handler(
            "test-fatal",
            source.clone(),
            Arc::new(move |_: &anyhow::Error| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("test");
        source.remaining.store(5, Ordering::SeqCst);
        wrapper.notify();
        wait_until(|| fatal_calls.load(Ordering::SeqCst) == 1);
        wrapper.notify();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(source.steps.load(Ordering::SeqCst), 1);
        drop(wrapper);
    }

    #[test]
    fn test_metrics_line_for_fixed_and_dynamic_cache() {
        let pipeline: Arc<dyn ContinuousBatchingPipeline> = Arc::new(
            crate::engine::reference::ReferencePipeline::new(Default::default()),
        );
        let metrics = PipelineMetrics {
            requests: 3,
            scheduled_requests: 2,
            cache_usage: 12.34,
            kv_cache_usage_bytes: 4096,
        };

        let fixed = PipelineWork::new(pipeline.clone(), false);
        assert_eq!(
            fixed.metrics_line(&metrics),
            "all requests: 3; scheduled requests: 2; cache usage 12.3%"
        );

        let dynamic = PipelineWork::new(pipeline, true);
        assert_eq!(
            dynamic.metrics_line(&metrics),
            "all requests: 3; scheduled requests: 2; cache usage 4096 bytes"
        );
    }
}
