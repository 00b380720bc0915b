//! Server telemetry: the fixed metric key set, the narrow snapshot trait
//! the sampler consumes, and the diff-on-tick stream itself.

mod stream;

pub use stream::{MetricsSubscription, SystemMetricsStream};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bus::EventBus;

/// The fixed key set of a system metric snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMetric {
    Connections,
    ReceivedMessages,
    SentMessages,
    SystemMemory,
    AllocatedMemory,
    HeapAllocatedMemory,
    Tasks,
    CommandsWaiting,
    QueriesWaiting,
    StartTime,
    SseSubscribers,
}

impl SystemMetric {
    pub const ALL: [SystemMetric; 11] = [
        SystemMetric::Connections,
        SystemMetric::ReceivedMessages,
        SystemMetric::SentMessages,
        SystemMetric::SystemMemory,
        SystemMetric::AllocatedMemory,
        SystemMetric::HeapAllocatedMemory,
        SystemMetric::Tasks,
        SystemMetric::CommandsWaiting,
        SystemMetric::QueriesWaiting,
        SystemMetric::StartTime,
        SystemMetric::SseSubscribers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SystemMetric::Connections => "connections",
            SystemMetric::ReceivedMessages => "received_messages",
            SystemMetric::SentMessages => "sent_messages",
            SystemMetric::SystemMemory => "system_memory",
            SystemMetric::AllocatedMemory => "allocated_memory",
            SystemMetric::HeapAllocatedMemory => "heap_allocated_memory",
            SystemMetric::Tasks => "tasks",
            SystemMetric::CommandsWaiting => "commands_waiting",
            SystemMetric::QueriesWaiting => "queries_waiting",
            SystemMetric::StartTime => "start_time",
            SystemMetric::SseSubscribers => "sse_subscribers",
        }
    }
}

/// A snapshot maps every metric name to its stringified value.
pub type MetricSnapshot = HashMap<String, String>;

/// Change-event delivered to metrics stream subscribers: one per metric
/// whose value differs from the previously published one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricChanged {
    pub metric: String,
    pub value: String,
}

pub type MetricsBus = EventBus<MetricChanged>;

/// Read-only view of server state the sampler polls. The supervisor
/// implements this; keeping the sampler on the narrow trait avoids the
/// supervisor-owns-sampler-reads-supervisor cycle.
pub trait MetricsSource: Send + Sync {
    fn system_metrics(&self) -> MetricSnapshot;
}
