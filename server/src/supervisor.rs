//! Top-level lifecycle orchestrator: starts the connections handler, the
//! control API and the metrics sampler, converts OS signals and
//! programmatic kills into one internal shutdown event, and bounds the
//! drain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::timeout;
use uuid::Uuid;

use crate::api::ControlApi;
use crate::connections::{Command, ConnectionsHandler, Query};
use crate::error::ConnectorError;
use crate::metrics::{
    MetricSnapshot, MetricsSource, MetricsSubscription, SystemMetric, SystemMetricsStream,
};
use crate::registry::{ConnectionRegistry, DeviceConnectionSummary};

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Supervisor lifecycle. Transitions are monotonic:
/// `Created → Started → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Started,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SupervisorState::Created => "created",
            SupervisorState::Started => "started",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// The connector's central process. Owns the registry, the connections
/// handler, the optional control API and the metrics stream; [`start`]
/// blocks until an OS signal (`SIGINT`/`SIGTERM`) or [`kill`] arrives and
/// then drains everything within the configured shutdown timeout.
///
/// [`start`]: Supervisor::start
/// [`kill`]: Supervisor::kill
pub struct Supervisor {
    id: String,
    start_time: i64,
    state: Mutex<SupervisorState>,
    shutdown_timeout: Duration,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionsHandler>,
    control_api: Option<Arc<dyn ControlApi>>,
    metrics_stream: SystemMetricsStream,
    kill_signal: Notify,
    system: Mutex<System>,
    device_address: Mutex<Option<SocketAddr>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn ConnectionsHandler>,
        control_api: Option<Arc<dyn ControlApi>>,
        shutdown_timeout: Duration,
        metrics_interval: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start_time: Utc::now().timestamp(),
            state: Mutex::new(SupervisorState::Created),
            shutdown_timeout,
            registry,
            handler,
            control_api,
            metrics_stream: SystemMetricsStream::new(metrics_interval),
            kill_signal: Notify::new(),
            system: Mutex::new(System::new()),
            device_address: Mutex::new(None),
        }
    }

    /// Starts all child subsystems and blocks until shutdown completes.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConnectorError> {
        tracing::debug!("starting connector #{}", self.id);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (complete_tx, mut complete_rx) = mpsc::channel::<()>(1);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handler = Arc::clone(&self.handler);
        let handler_task = tokio::spawn(async move {
            if let Err(err) = handler.start(shutdown_rx, complete_tx, ready_tx).await {
                tracing::error!(error = %err, "connections handler terminated");
            }
        });

        // The handler reports its bound address once it is accepting; a
        // dropped sender means it died before becoming operational, and
        // the supervisor refuses to enter Started.
        let bound = match ready_rx.await {
            Ok(addr) => addr,
            Err(_) => {
                handler_task.abort();
                return Err(ConnectorError::Startup(
                    "connections handler failed to start".to_string(),
                ));
            }
        };
        tracing::info!("connections handler listening on {bound}");
        *self.device_address.lock().expect("address lock poisoned") = Some(bound);

        if let Some(api) = &self.control_api {
            let api = Arc::clone(api);
            let connector = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = api.start(connector).await {
                    tracing::error!(error = %err, "control API terminated");
                }
            });
        }

        let sampler = self
            .metrics_stream
            .start(Arc::clone(self) as Arc<dyn MetricsSource>);

        self.set_state(SupervisorState::Started);
        tracing::info!("connector #{} started", self.id);

        self.wait_for_shutdown().await;
        tracing::info!("connector received shutdown signal");

        let _ = shutdown_tx.send(true);
        match timeout(self.shutdown_timeout, complete_rx.recv()).await {
            Ok(Some(())) => tracing::debug!("connections handler drained"),
            _ => tracing::warn!(
                "{}",
                ConnectorError::ShutdownTimeout(self.shutdown_timeout)
            ),
        }

        self.metrics_stream.stop();
        let _ = sampler.await;

        if let Some(api) = &self.control_api {
            api.stop().await;
        }

        handler_task.abort();
        self.set_state(SupervisorState::Stopped);

        tracing::info!("connector stopped");
        tracing::info!(
            "  total received messages processed: {}",
            self.registry.total_received_messages()
        );
        tracing::info!(
            "  total sent messages processed: {}",
            self.registry.total_sent_messages()
        );
        tracing::info!("  uptime: {} seconds", self.uptime(""));

        Ok(())
    }

    /// Programmatic equivalent of receiving an OS signal.
    pub fn kill(&self) {
        self.kill_signal.notify_one();
    }

    async fn wait_for_shutdown(&self) {
        let interrupt = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "installing SIGINT handler failed");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "installing SIGTERM handler failed");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => tracing::debug!("SIGINT received"),
            _ = terminate => tracing::debug!("SIGTERM received"),
            _ = self.kill_signal.notified() => tracing::debug!("kill requested"),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Where the connections handler is accepting devices, once started.
    pub fn device_address(&self) -> Option<SocketAddr> {
        *self.device_address.lock().expect("address lock poisoned")
    }

    /// Seconds since the connector started, or since the given device
    /// connected. `0` for an unknown device.
    pub fn uptime(&self, device_id: &str) -> i64 {
        if device_id.is_empty() {
            return Utc::now().timestamp() - self.start_time;
        }

        self.registry
            .get(device_id)
            .map(|connection| connection.uptime())
            .unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.registry.open_connections()
    }

    pub fn connected_devices(&self) -> Vec<DeviceConnectionSummary> {
        self.registry.connected_devices()
    }

    /// Messages received from a device, or globally when `device_id` is
    /// empty.
    pub fn received_messages(&self, device_id: &str) -> u64 {
        if device_id.is_empty() {
            self.registry.total_received_messages()
        } else {
            self.registry.received_messages(device_id)
        }
    }

    /// Messages sent to a device, or globally when `device_id` is empty.
    pub fn sent_messages(&self, device_id: &str) -> u64 {
        if device_id.is_empty() {
            self.registry.total_sent_messages()
        } else {
            self.registry.sent_messages(device_id)
        }
    }

    pub async fn send_command(&self, command: Command) -> Result<String, ConnectorError> {
        self.handler.send_command(command).await
    }

    pub async fn send_query(&self, query: Query) -> Result<String, ConnectorError> {
        self.handler.send_query(query).await
    }

    pub fn commands_waiting(&self) -> usize {
        self.handler.commands_waiting()
    }

    pub fn queries_waiting(&self) -> usize {
        self.handler.queries_waiting()
    }

    pub fn sse_subscribers(&self) -> usize {
        self.metrics_stream.subscribers()
    }

    /// Attach a subscriber to the live metrics stream.
    pub fn subscribe_to_metrics(&self) -> MetricsSubscription {
        self.metrics_stream.subscribe()
    }

    /// Megabytes of (virtual, resident) memory of this process plus the
    /// system-wide used memory, in that order.
    fn memory_megabytes(&self) -> (u64, u64, u64) {
        let mut system = self.system.lock().expect("sysinfo lock poisoned");
        system.refresh_memory();

        let (mut virtual_mb, mut resident_mb) = (0, 0);
        if let Ok(pid) = sysinfo::get_current_pid() {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid) {
                virtual_mb = process.virtual_memory() / BYTES_PER_MEGABYTE;
                resident_mb = process.memory() / BYTES_PER_MEGABYTE;
            }
        }

        let used_mb = system.used_memory() / BYTES_PER_MEGABYTE;
        (virtual_mb, resident_mb, used_mb)
    }

    fn alive_tasks(&self) -> usize {
        tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks())
            .unwrap_or(0)
    }

    /// The full metric snapshot over the fixed key set.
    pub fn system_metrics(&self) -> MetricSnapshot {
        let (virtual_mb, resident_mb, used_mb) = self.memory_megabytes();

        let mut metrics = MetricSnapshot::new();
        let mut put = |metric: SystemMetric, value: String| {
            metrics.insert(metric.as_str().to_string(), value);
        };

        put(SystemMetric::Connections, self.open_connections().to_string());
        put(
            SystemMetric::ReceivedMessages,
            self.registry.total_received_messages().to_string(),
        );
        put(
            SystemMetric::SentMessages,
            self.registry.total_sent_messages().to_string(),
        );
        put(SystemMetric::SystemMemory, virtual_mb.to_string());
        put(SystemMetric::AllocatedMemory, resident_mb.to_string());
        put(SystemMetric::HeapAllocatedMemory, used_mb.to_string());
        put(SystemMetric::Tasks, self.alive_tasks().to_string());
        put(
            SystemMetric::CommandsWaiting,
            self.commands_waiting().to_string(),
        );
        put(
            SystemMetric::QueriesWaiting,
            self.queries_waiting().to_string(),
        );
        put(SystemMetric::StartTime, self.start_time.to_string());
        put(
            SystemMetric::SseSubscribers,
            self.sse_subscribers().to_string(),
        );

        metrics
    }
}

impl MetricsSource for Supervisor {
    fn system_metrics(&self) -> HashMap<String, String> {
        Supervisor::system_metrics(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::SocketAddr;

    /// Handler stub that binds nothing and answers with a fixed payload.
    struct StubHandler {
        fail_start: bool,
    }

    #[async_trait]
    impl ConnectionsHandler for StubHandler {
        async fn start(
            &self,
            mut shutdown: watch::Receiver<bool>,
            shutdown_complete: mpsc::Sender<()>,
            ready: oneshot::Sender<SocketAddr>,
        ) -> Result<(), ConnectorError> {
            if self.fail_start {
                // Dropping `ready` unsent is the startup-failure signal.
                return Err(ConnectorError::Startup("bind refused".to_string()));
            }
            let _ = ready.send("127.0.0.1:0".parse().unwrap());
            let _ = shutdown.changed().await;
            let _ = shutdown_complete.send(()).await;
            Ok(())
        }

        async fn send_command(&self, command: Command) -> Result<String, ConnectorError> {
            Ok(format!("echo:{}", command.payload))
        }

        async fn send_query(&self, _query: Query) -> Result<String, ConnectorError> {
            Err(ConnectorError::NotConnected("stub".to_string()))
        }

        fn commands_waiting(&self) -> usize {
            0
        }

        fn queries_waiting(&self) -> usize {
            2
        }
    }

    fn supervisor(fail_start: bool) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(StubHandler { fail_start }),
            None,
            Duration::from_secs(1),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn test_kill_walks_created_started_stopped() {
        let connector = supervisor(false);
        assert_eq!(connector.state(), SupervisorState::Created);

        let run = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.start().await })
        };

        // Wait for Started, then kill.
        for _ in 0..100 {
            if connector.state() == SupervisorState::Started {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.state(), SupervisorState::Started);

        connector.kill();
        run.await.unwrap().unwrap();
        assert_eq!(connector.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_startup_failure_refuses_started() {
        let connector = supervisor(true);
        let result = connector.start().await;
        assert!(matches!(result, Err(ConnectorError::Startup(_))));
        assert_eq!(connector.state(), SupervisorState::Created);
    }

    #[tokio::test]
    async fn test_system_metrics_cover_the_fixed_key_set() {
        let connector = supervisor(false);
        let metrics = connector.system_metrics();

        for metric in SystemMetric::ALL {
            assert!(
                metrics.contains_key(metric.as_str()),
                "missing metric {}",
                metric.as_str()
            );
        }
        assert_eq!(metrics["connections"], "0");
        assert_eq!(metrics["queries_waiting"], "2");
        assert_eq!(metrics["start_time"], connector.start_time().to_string());
    }

    #[tokio::test]
    async fn test_uptime_semantics() {
        let connector = supervisor(false);
        assert!(connector.uptime("") >= 0);
        assert_eq!(connector.uptime("unknown-device"), 0);

        connector
            .registry
            .add("c1", "d1", "", "", "", "127.0.0.1:1")
            .unwrap();
        assert!(connector.uptime("d1") >= 0);
    }
}
