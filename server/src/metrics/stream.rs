use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::events::SYSTEM_METRICS_TOPIC;
use crate::metrics::{MetricChanged, MetricSnapshot, MetricsBus, MetricsSource, SystemMetric};

const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// Samples server metrics on an interval and publishes one change-event
/// per metric that moved since the previous tick. The SSE endpoint is
/// latency-insensitive but traffic-sensitive; diffing on the tick bounds
/// the stream to at most one event per metric per tick.
pub struct SystemMetricsStream {
    publish_interval: Duration,
    bus: Arc<MetricsBus>,
    stop_tx: watch::Sender<bool>,
}

impl SystemMetricsStream {
    /// A zero interval falls back to the 5 s default.
    pub fn new(publish_interval: Duration) -> Self {
        let interval = if publish_interval.is_zero() {
            DEFAULT_PUBLISH_INTERVAL
        } else {
            publish_interval
        };
        let (stop_tx, _) = watch::channel(false);

        Self {
            publish_interval: interval,
            bus: Arc::new(MetricsBus::new()),
            stop_tx,
        }
    }

    /// Spawns the sampler task polling `source` every interval.
    pub fn start(&self, source: Arc<dyn MetricsSource>) -> JoinHandle<()> {
        let publish_interval = self.publish_interval;
        let bus = Arc::clone(&self.bus);
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(publish_interval);
            // Skip the immediate first tick; the first sample happens one
            // interval after start, as subscribers expect.
            ticker.tick().await;

            let mut previous = MetricSnapshot::new();

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::debug!("metrics stream stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let mut current = source.system_metrics();
                        current.insert(
                            SystemMetric::SseSubscribers.as_str().to_string(),
                            bus.subscriber_count(SYSTEM_METRICS_TOPIC).to_string(),
                        );
                        publish_changed(&bus, &previous, &current);
                        previous = current;
                    }
                }
            }
        })
    }

    /// Signals the sampler task to exit after its current select arm.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Registers a new stream subscriber. Dropping the subscription
    /// unsubscribes it.
    pub fn subscribe(&self) -> MetricsSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.subscribe(SYSTEM_METRICS_TOPIC, tx.clone());

        MetricsSubscription {
            inner: UnboundedReceiverStream::new(rx),
            bus: Arc::clone(&self.bus),
            sender: tx,
        }
    }

    /// Subscribers currently attached to the metrics topic.
    pub fn subscribers(&self) -> usize {
        self.bus.subscriber_count(SYSTEM_METRICS_TOPIC)
    }
}

fn publish_changed(bus: &MetricsBus, previous: &MetricSnapshot, current: &MetricSnapshot) {
    for (metric, value) in current {
        if previous.get(metric) != Some(value) {
            tracing::debug!(
                metric,
                previous = previous.get(metric).map(String::as_str).unwrap_or(""),
                value,
                "system metric changed"
            );
            let _ = bus.publish(
                SYSTEM_METRICS_TOPIC,
                MetricChanged {
                    metric: metric.clone(),
                    value: value.clone(),
                },
            );
        }
    }
}

/// A live subscription to the metrics stream. Implements [`Stream`] so the
/// SSE endpoint can consume it directly; unsubscribes from the bus on
/// drop.
pub struct MetricsSubscription {
    inner: UnboundedReceiverStream<MetricChanged>,
    bus: Arc<MetricsBus>,
    sender: UnboundedSender<MetricChanged>,
}

impl MetricsSubscription {
    pub async fn recv(&mut self) -> Option<MetricChanged> {
        use futures_util::StreamExt;
        self.inner.next().await
    }
}

impl Stream for MetricsSubscription {
    type Item = MetricChanged;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for MetricsSubscription {
    fn drop(&mut self) {
        let _ = self.bus.unsubscribe(SYSTEM_METRICS_TOPIC, &self.sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// Metrics source whose values the test scripts by hand.
    struct ScriptedSource {
        values: Mutex<HashMap<String, String>>,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(HashMap::from([(
                    "connections".to_string(),
                    "3".to_string(),
                )])),
            })
        }

        fn set(&self, metric: &str, value: &str) {
            self.values
                .lock()
                .unwrap()
                .insert(metric.to_string(), value.to_string());
        }
    }

    impl MetricsSource for ScriptedSource {
        fn system_metrics(&self) -> MetricSnapshot {
            self.values.lock().unwrap().clone()
        }
    }

    async fn next_event(sub: &mut MetricsSubscription) -> MetricChanged {
        timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("no metric event within timeout")
            .expect("metrics stream closed")
    }

    async fn drain_baseline(sub: &mut MetricsSubscription) {
        // First tick publishes every key (change from the empty baseline).
        let mut seen = 0;
        while seen < 2 {
            next_event(sub).await;
            seen += 1;
        }
    }

    #[tokio::test]
    async fn test_changed_metric_published_once_per_subscriber() {
        let source = ScriptedSource::new();
        let stream = SystemMetricsStream::new(Duration::from_millis(30));
        let mut sub = stream.subscribe();
        let task = stream.start(source.clone() as Arc<dyn MetricsSource>);

        // Baseline tick: connections=3 and sse_subscribers=1.
        drain_baseline(&mut sub).await;

        source.set("connections", "4");
        let event = next_event(&mut sub).await;
        assert_eq!(event.metric, "connections");
        assert_eq!(event.value, "4");

        stream.stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_unchanged_metrics_publish_nothing() {
        let source = ScriptedSource::new();
        let stream = SystemMetricsStream::new(Duration::from_millis(30));
        let mut sub = stream.subscribe();
        let task = stream.start(source as Arc<dyn MetricsSource>);

        drain_baseline(&mut sub).await;

        // Several ticks with identical values: nothing arrives.
        let quiet = timeout(Duration::from_millis(150), sub.recv()).await;
        assert!(quiet.is_err(), "expected silence while metrics are stable");

        stream.stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_own_subscription_is_reported_as_sse_subscribers() {
        let source = ScriptedSource::new();
        let stream = SystemMetricsStream::new(Duration::from_millis(30));
        let mut sub = stream.subscribe();
        let task = stream.start(source as Arc<dyn MetricsSource>);

        let mut got_subscribers_event = false;
        for _ in 0..2 {
            let event = next_event(&mut sub).await;
            if event.metric == "sse_subscribers" {
                assert_eq!(event.value, "1");
                got_subscribers_event = true;
            }
        }
        assert!(got_subscribers_event);

        stream.stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let stream = SystemMetricsStream::new(Duration::from_millis(30));
        let sub = stream.subscribe();
        assert_eq!(stream.subscribers(), 1);
        drop(sub);
        assert_eq!(stream.subscribers(), 0);
    }

    #[test]
    fn test_zero_interval_falls_back_to_default() {
        let stream = SystemMetricsStream::new(Duration::ZERO);
        assert_eq!(stream.publish_interval, DEFAULT_PUBLISH_INTERVAL);
    }
}
