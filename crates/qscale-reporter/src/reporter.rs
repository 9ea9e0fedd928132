//! Reporter — the background task that ships buffered samples.
//!
//! Every `report_interval` the reporter runs the registered job collectors,
//! drains the [`MetricsStore`] and delivers one [`Report`]. A failed delivery
//! loses that tick's samples; the next tick starts from an empty buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use qscale_core::{AdapterRegistry, Config, Metric};
use qscale_metrics::MetricsStore;

use crate::error::{ReportError, StartError};
use crate::report::Report;
use crate::transport::{HttpTransport, Transport};

/// What one report cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The store was empty; no request was made.
    NothingToReport,
    /// This many samples were delivered.
    Reported(usize),
    /// Delivery failed and the dumped samples were discarded.
    Failed { dropped: usize, error: ReportError },
}

pub struct Reporter {
    config: Arc<Config>,
    store: Arc<MetricsStore>,
    registry: Arc<AdapterRegistry>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    timeout: Duration,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reporter {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MetricsStore>,
        registry: Arc<AdapterRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            interval: config.report_interval(),
            timeout: config.report_timeout(),
            config,
            store,
            registry,
            transport,
            started: AtomicBool::new(false),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// A reporter delivering over HTTP to the configured `api_base_url`.
    pub fn from_config(
        config: Arc<Config>,
        store: Arc<MetricsStore>,
        registry: Arc<AdapterRegistry>,
    ) -> Result<Self, StartError> {
        let Some(url) = config.api_base_url.as_deref() else {
            error!("not reporting metrics: api_base_url is not configured");
            return Err(StartError::MissingApiUrl);
        };
        let transport = HttpTransport::new(url).map_err(|e| {
            error!(error = %e, "not reporting metrics");
            StartError::InvalidApiUrl(e)
        })?;
        Ok(Self::new(config, store, registry, Arc::new(transport)))
    }

    /// Override the tick interval taken from config.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the delivery timeout taken from config.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Launch the reporting loop on the current tokio runtime.
    ///
    /// Returns `Ok(false)` if the loop is already running.
    pub fn start(self: &Arc<Self>) -> Result<bool, StartError> {
        let runtime = Handle::try_current().map_err(|_| {
            error!("not reporting metrics: no tokio runtime");
            StartError::NoRuntime
        })?;

        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        if self.store.flush_timeout() < self.interval {
            warn!(
                flush_timeout_secs = self.store.flush_timeout().as_secs_f64(),
                interval_secs = self.interval.as_secs_f64(),
                "metrics store cutoff is shorter than the report interval, web samples will be dropped"
            );
        }

        self.shutdown_tx.send_replace(false);
        let shutdown = self.shutdown_tx.subscribe();
        let reporter = Arc::clone(self);
        let handle = runtime.spawn(async move { reporter.run(shutdown).await });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            interval_secs = self.interval.as_secs_f64(),
            adapters = self.registry.len(),
            "reporter started"
        );
        Ok(true)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Signal the loop to exit and wait for it. An in-flight cycle finishes first.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "reporter loop ended abnormally");
            }
        }
        self.started.store(false, Ordering::Release);
        info!("reporter stopped");
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    debug!("reporter loop shutting down");
                    break;
                }
            }

            let reporter = Arc::clone(&self);
            let cycle = tokio::spawn(async move { reporter.report_cycle().await });
            if let Err(e) = cycle.await {
                error!(error = %e, "report cycle panicked");
            }
        }
    }

    /// Collect, dump and deliver once.
    pub async fn report_cycle(&self) -> CycleOutcome {
        self.collect_jobs().await;

        let metrics = self.store.dump();
        if metrics.is_empty() {
            debug!("nothing to report");
            return CycleOutcome::NothingToReport;
        }

        let count = metrics.len();
        match self.deliver(metrics).await {
            Ok(()) => {
                info!(metrics = count, "reported successfully");
                CycleOutcome::Reported(count)
            }
            Err(error) => {
                error!(error = %error, dropped = count, "report failed");
                CycleOutcome::Failed {
                    dropped: count,
                    error,
                }
            }
        }
    }

    /// Run every job collector on the blocking pool, in registration order.
    async fn collect_jobs(&self) {
        for collector in self.registry.collectors() {
            let adapter = collector.adapter_id().to_string();
            match tokio::task::spawn_blocking(move || collector.collect()).await {
                Ok(metrics) => self.store.push_collected(metrics),
                Err(e) => error!(adapter = %adapter, error = %e, "collector failed"),
            }
        }
    }

    async fn deliver(&self, metrics: Vec<Metric>) -> Result<(), ReportError> {
        let report = Report::new(&self.registry.adapters(), &self.config, metrics)?;
        let payload = report.to_json()?;
        match timeout(self.timeout, self.transport.deliver(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ReportError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    use qscale_core::{Adapter, MetricIdentifier, QueueMetricsCollector};
    use qscale_metrics::{BackendKind, InMemoryBackend, JobMetricsCollector};
    use serde_json::Value;
    use tracing_subscriber::fmt::MakeWriter;

    use crate::transport::BoxFuture;

    /// Records every payload; fails the first `failures` deliveries.
    #[derive(Default)]
    struct MockTransport {
        payloads: Mutex<Vec<Value>>,
        failures: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MockTransport {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn payloads(&self) -> Vec<Value> {
            self.payloads.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn deliver(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), ReportError>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    sleep(delay).await;
                }
                self.payloads
                    .lock()
                    .unwrap()
                    .push(serde_json::from_slice(&payload).unwrap());
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(ReportError::Status {
                        status: 503,
                        body: "unavailable".into(),
                    });
                }
                Ok(())
            })
        }
    }

    struct PanickingCollector;

    impl QueueMetricsCollector for PanickingCollector {
        fn adapter_id(&self) -> &str {
            "broken"
        }
        fn enabled(&self) -> bool {
            true
        }
        fn collect(&self) -> Vec<Metric> {
            panic!("backend exploded");
        }
        fn queues(&self) -> Vec<String> {
            Vec::new()
        }
        fn clear_queues(&self) {}
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn log_capture() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (buffer, guard)
    }

    struct Fixture {
        config: Arc<Config>,
        store: Arc<MetricsStore>,
        registry: Arc<AdapterRegistry>,
        transport: Arc<MockTransport>,
    }

    impl Fixture {
        fn new(transport: MockTransport) -> Self {
            Self {
                config: Arc::new(Config::default()),
                store: Arc::new(MetricsStore::new()),
                registry: Arc::new(AdapterRegistry::new()),
                transport: Arc::new(transport),
            }
        }

        fn reporter(&self) -> Reporter {
            Reporter::new(
                self.config.clone(),
                self.store.clone(),
                self.registry.clone(),
                self.transport.clone(),
            )
        }

        fn register_job(&self, kind: BackendKind, queues: &[(&str, u64, u64)]) {
            let backend = InMemoryBackend::new();
            for (name, depth, latency_ms) in queues {
                backend.set_queue(name, *depth, Duration::from_millis(*latency_ms));
            }
            let collector =
                JobMetricsCollector::new(kind, backend, self.config.clone(), self.store.clone());
            self.registry.register(collector.into_adapter("1.0.0"));
        }
    }

    fn identifiers(payload: &Value) -> Vec<(String, Option<String>)> {
        payload["metrics"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| {
                (
                    m["identifier"].as_str().unwrap().to_string(),
                    m["queue_name"].as_str().map(str::to_string),
                )
            })
            .collect()
    }

    async fn wait_for_payloads(transport: &MockTransport, n: usize) {
        timeout(Duration::from_secs(5), async {
            while transport.payloads().len() < n {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for deliveries");
    }

    #[tokio::test]
    async fn empty_store_skips_delivery() {
        let (logs, _guard) = log_capture();
        let fixture = Fixture::new(MockTransport::default());

        let outcome = fixture.reporter().report_cycle().await;

        assert!(matches!(outcome, CycleOutcome::NothingToReport));
        assert!(fixture.transport.payloads().is_empty());
        assert!(logs.contents().contains("nothing to report"));
    }

    #[tokio::test]
    async fn web_samples_then_job_samples_in_registration_order() {
        let fixture = Fixture::new(MockTransport::default());
        fixture.register_job(BackendKind::Resque, &[("default", 2, 1500)]);
        fixture.register_job(BackendKind::Que, &[("mailers", 0, 300)]);
        fixture
            .store
            .push(MetricIdentifier::Qt, 42, SystemTime::now(), None);

        let outcome = fixture.reporter().report_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Reported(4)));
        let payloads = fixture.transport.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(
            identifiers(&payloads[0]),
            vec![
                ("qt".to_string(), None),
                ("qd".to_string(), Some("default".to_string())),
                ("qt".to_string(), Some("default".to_string())),
                ("qt".to_string(), Some("mailers".to_string())),
            ]
        );
        assert_eq!(payloads[0]["metrics"][2]["value"], 1500);
        assert!(payloads[0]["adapters"]["qscale-resque"].is_object());
        assert!(payloads[0]["adapters"]["qscale-que"].is_object());
        assert!(payloads[0]["config"]["resque"].is_object());
        assert!(fixture.store.is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_drops_samples() {
        let (logs, _guard) = log_capture();
        let fixture = Fixture::new(MockTransport::failing(1));
        let reporter = fixture.reporter();
        fixture
            .store
            .push(MetricIdentifier::Qt, 10, SystemTime::now(), None);
        fixture
            .store
            .push(MetricIdentifier::Qt, 20, SystemTime::now(), None);

        match reporter.report_cycle().await {
            CycleOutcome::Failed { dropped, error } => {
                assert_eq!(dropped, 2);
                assert!(matches!(error, ReportError::Status { status: 503, .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(fixture.store.is_empty());
        assert!(logs.contents().contains("report failed"));

        assert!(matches!(
            reporter.report_cycle().await,
            CycleOutcome::NothingToReport
        ));
        assert_eq!(fixture.transport.payloads().len(), 1);
    }

    #[tokio::test]
    async fn job_metrics_survive_interval_longer_than_cutoff() {
        let fixture = Fixture {
            store: Arc::new(MetricsStore::with_flush_timeout(Duration::from_millis(50))),
            ..Fixture::new(MockTransport::failing(1))
        };
        fixture.register_job(BackendKind::Sidekiq, &[("default", 7, 400)]);
        let reporter = fixture.reporter();

        assert!(matches!(
            reporter.report_cycle().await,
            CycleOutcome::Failed { dropped: 2, .. }
        ));
        sleep(Duration::from_millis(100)).await;

        assert!(matches!(reporter.report_cycle().await, CycleOutcome::Reported(2)));
        let payloads = fixture.transport.payloads();
        assert_eq!(
            identifiers(&payloads[1]),
            vec![
                ("qd".to_string(), Some("default".to_string())),
                ("qt".to_string(), Some("default".to_string())),
            ]
        );
        assert_eq!(payloads[1]["metrics"][0]["value"], 7);
    }

    #[tokio::test]
    async fn slow_delivery_times_out() {
        let fixture = Fixture::new(MockTransport::slow(Duration::from_secs(10)));
        let reporter = fixture
            .reporter()
            .with_timeout(Duration::from_millis(20));
        fixture
            .store
            .push(MetricIdentifier::Qt, 5, SystemTime::now(), None);

        match reporter.report_cycle().await {
            CycleOutcome::Failed { dropped: 1, error } => {
                assert!(matches!(error, ReportError::Timeout(_)));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_collector_is_skipped() {
        let (logs, _guard) = log_capture();
        let fixture = Fixture::new(MockTransport::default());
        fixture
            .registry
            .register(Adapter::new("qscale-broken").with_collector(Arc::new(PanickingCollector)));
        fixture.register_job(BackendKind::Sidekiq, &[("default", 1, 100)]);

        let outcome = fixture.reporter().report_cycle().await;

        assert!(matches!(outcome, CycleOutcome::Reported(2)));
        let logs = logs.contents();
        assert!(logs.contains("collector failed"));
        assert!(logs.contains("broken"));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_ends_loop() {
        let fixture = Fixture::new(MockTransport::default());
        let reporter = Arc::new(fixture.reporter().with_interval(Duration::from_secs(3600)));

        assert!(!reporter.is_started());
        assert!(reporter.start().unwrap());
        assert!(!reporter.start().unwrap());
        assert!(reporter.is_started());

        timeout(Duration::from_secs(5), reporter.stop())
            .await
            .expect("stop should not wait for the next tick");
        assert!(!reporter.is_started());

        assert!(reporter.start().unwrap());
        reporter.stop().await;
    }

    #[test]
    fn start_without_runtime_fails() {
        let fixture = Fixture::new(MockTransport::default());
        let reporter = Arc::new(fixture.reporter());

        assert!(matches!(reporter.start(), Err(StartError::NoRuntime)));
        assert!(!reporter.is_started());
    }

    #[test]
    fn from_config_requires_usable_url() {
        let store = Arc::new(MetricsStore::new());
        let registry = Arc::new(AdapterRegistry::new());

        let missing = Reporter::from_config(Arc::new(Config::default()), store.clone(), registry.clone());
        assert!(matches!(missing, Err(StartError::MissingApiUrl)));

        let config = Config {
            api_base_url: Some("not a url".into()),
            ..Config::default()
        };
        let invalid = Reporter::from_config(Arc::new(config), store.clone(), registry.clone());
        assert!(matches!(invalid, Err(StartError::InvalidApiUrl(_))));

        let config = Config {
            api_base_url: Some("http://127.0.0.1:9/api/token".into()),
            report_interval_seconds: 15,
            ..Config::default()
        };
        let reporter = Reporter::from_config(Arc::new(config), store, registry).unwrap();
        assert_eq!(reporter.interval, Duration::from_secs(15));
    }

    #[test]
    fn from_config_accepts_https_api() {
        let config = Config::from_toml_str(
            r#"api_base_url = "https://autoscale.example.com/api/abc123""#,
        )
        .unwrap();

        let reporter = Reporter::from_config(
            Arc::new(config),
            Arc::new(MetricsStore::new()),
            Arc::new(AdapterRegistry::new()),
        );

        assert!(reporter.is_ok(), "{:?}", reporter.err());
    }

    #[tokio::test]
    async fn loop_keeps_ticking_after_failure() {
        let fixture = Fixture::new(MockTransport::failing(1));
        let reporter = Arc::new(fixture.reporter().with_interval(Duration::from_millis(20)));

        fixture
            .store
            .push(MetricIdentifier::Qt, 1, SystemTime::now(), None);
        reporter.start().unwrap();
        wait_for_payloads(&fixture.transport, 1).await;

        fixture
            .store
            .push(MetricIdentifier::Qt, 2, SystemTime::now(), None);
        wait_for_payloads(&fixture.transport, 2).await;
        reporter.stop().await;

        let payloads = fixture.transport.payloads();
        assert_eq!(payloads[0]["metrics"][0]["value"], 1);
        assert_eq!(payloads[1]["metrics"].as_array().unwrap().len(), 1);
        assert_eq!(payloads[1]["metrics"][0]["value"], 2);
    }
}
