//! Metrics emitted by the location resolver.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
}

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "location.cache.hit",
    metric_type: MetricType::Counter,
    description: "Service definition lookups answered from the topology cache",
};

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "location.cache.negative_hit",
    metric_type: MetricType::Counter,
    description: "Lookups answered by a recorded miss",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "location.cache.miss",
    metric_type: MetricType::Counter,
    description: "Lookups the cache could not answer",
};

pub const RECONCILE: MetricDef = MetricDef {
    name: "location.cache.reconcile",
    metric_type: MetricType::Counter,
    description: "Snapshots merged into a topology cache",
};

pub const FULL_INVALIDATION: MetricDef = MetricDef {
    name: "location.cache.invalidated",
    metric_type: MetricType::Counter,
    description: "Reconciliations that discarded the whole cache after a change id mismatch",
};

pub const DISK_FAILURE: MetricDef = MetricDef {
    name: "location.disk.failure",
    metric_type: MetricType::Counter,
    description: "Cache or identity documents that could not be read or written",
};

pub const CONNECT: MetricDef = MetricDef {
    name: "location.connect",
    metric_type: MetricType::Counter,
    description: "Connection data requests sent to a server",
};

pub const CONNECT_DURATION: MetricDef = MetricDef {
    name: "location.connect.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a connect round trip in seconds",
};

pub const CONNECT_TIMEOUT_RETRY: MetricDef = MetricDef {
    name: "location.connect.timeout_retry",
    metric_type: MetricType::Counter,
    description: "Connect round trips retried after a timeout",
};

pub const PROVIDER_CREATED: MetricDef = MetricDef {
    name: "location.provider.created",
    metric_type: MetricType::Counter,
    description: "Connection providers constructed for delegated servers",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    NEGATIVE_CACHE_HIT,
    CACHE_MISS,
    RECONCILE,
    FULL_INVALIDATION,
    DISK_FAILURE,
    CONNECT,
    CONNECT_DURATION,
    CONNECT_TIMEOUT_RETRY,
    PROVIDER_CREATED,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_are_unique() {
        let names: HashSet<_> = ALL_METRICS.iter().map(|def| def.name).collect();
        assert_eq!(names.len(), ALL_METRICS.len());
        assert!(ALL_METRICS.iter().all(|def| def.name.starts_with("location.")));
    }
}
