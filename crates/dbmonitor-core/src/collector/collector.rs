//! Scrape orchestration across all registered instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use prometheus::core::Desc;
use prometheus::proto::MetricFamily;
use tracing::{debug, warn};

use super::mapper::{MetricEmission, MetricMapper, MetricVariant};
use super::sampler::SessionSampler;
use crate::registry::ConnectionRegistry;

/// Upper bound on one instance's processlist query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Exports the session list of every registered instance.
///
/// Each call to [`Collector::collect`] queries all instances concurrently.
/// An instance whose query fails or times out contributes nothing to that
/// scrape; the others are unaffected.
pub struct Collector {
    registry: Arc<ConnectionRegistry>,
    sampler: SessionSampler,
    mapper: MetricMapper,
}

impl Collector {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            sampler: SessionSampler::new(DEFAULT_QUERY_TIMEOUT),
            mapper: MetricMapper::default(),
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.sampler = SessionSampler::new(timeout);
        self
    }

    pub fn with_variant(mut self, variant: MetricVariant) -> Self {
        self.mapper = MetricMapper::new(variant);
        self
    }

    pub fn mapper(&self) -> &MetricMapper {
        &self.mapper
    }

    /// Static descriptor of the exported metric.
    pub fn describe(&self) -> prometheus::Result<Desc> {
        self.mapper.desc()
    }

    /// Samples every instance and returns the merged emissions.
    ///
    /// Within one instance, emissions follow result-set order. Instances
    /// appear in name order.
    pub async fn collect(&self) -> Vec<MetricEmission> {
        let instances = self.registry.snapshot();

        let samples = instances.iter().map(|(name, source)| async move {
            let start = Instant::now();
            let result = self.sampler.sample(name, source.as_ref()).await;
            (name, result, start.elapsed())
        });

        let mut emissions = Vec::new();
        for (name, result, elapsed) in join_all(samples).await {
            match result {
                Ok(records) => {
                    let before = emissions.len();
                    emissions.extend(records.iter().filter_map(|r| self.mapper.map(name, r)));
                    debug!(
                        instance = %name,
                        sessions = records.len(),
                        emitted = emissions.len() - before,
                        duration_ms = elapsed.as_millis() as u64,
                        "instance sampled"
                    );
                }
                Err(e) => {
                    warn!(instance = %name, error = %e,
                        duration_ms = elapsed.as_millis() as u64,
                        "failed to sample processlist");
                }
            }
        }

        emissions
    }

    /// Collects and maps into metric families ready for text encoding.
    pub async fn gather(&self) -> prometheus::Result<Vec<MetricFamily>> {
        let emissions = self.collect().await;
        self.mapper.encode(&emissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{MockSource, RecordingConnector, row};
    use crate::config::InstanceConfig;

    fn instance(name: &str, host: &str) -> InstanceConfig {
        InstanceConfig {
            instance: name.to_string(),
            host: host.to_string(),
            user: "monitor".to_string(),
            ..Default::default()
        }
    }

    fn three_rows() -> MockSource {
        MockSource::with_rows(vec![
            Ok(row("1", "app", "10.0.0.5:33000", "Sleep", "12")),
            Ok(row("2", "app", "10.0.0.6", "Query", "N/A")),
            Ok(row("3", "batch", "10.0.0.7:1", "Query", "3")),
        ])
    }

    #[test]
    fn describe_is_independent_of_instances() {
        let registry = Arc::new(ConnectionRegistry::new(RecordingConnector::new()));
        let collector = Collector::new(registry);
        let desc = collector.describe().unwrap();
        assert_eq!(desc.fq_name, "mysqlconn");
        assert_eq!(desc.variable_labels.len(), 7);
    }

    #[tokio::test]
    async fn collect_with_empty_registry() {
        let registry = Arc::new(ConnectionRegistry::new(RecordingConnector::new()));
        let collector = Collector::new(registry);
        assert!(collector.collect().await.is_empty());
        assert!(collector.gather().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_elapsed_time_emits_zero() {
        let connector = RecordingConnector::new().with_source("db-a", three_rows());
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.discover(&[instance("a", "db-a")]);

        let emissions = Collector::new(registry).collect().await;
        assert_eq!(emissions.len(), 3);
        assert_eq!(emissions[0].host, "10.0.0.5");
        assert_eq!(emissions[0].value, 12.0);
        assert_eq!(emissions[1].host, "10.0.0.6");
        assert_eq!(emissions[1].value, 0.0);
        assert_eq!(emissions[2].id, "3");
        assert!(emissions.iter().all(|e| e.instance == "a"));
    }

    #[tokio::test]
    async fn open_failure_leaves_only_reachable_instance() {
        let connector = RecordingConnector::new()
            .with_source("db-a", three_rows())
            .failing_host("db-b");
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.discover(&[instance("a", "db-a"), instance("b", "db-b")]);

        let emissions = Collector::new(registry).collect().await;
        assert_eq!(emissions.len(), 3);
        assert!(emissions.iter().all(|e| e.instance == "a"));
    }

    #[tokio::test]
    async fn query_failure_isolated_to_instance() {
        let connector = RecordingConnector::new()
            .with_source("db-a", three_rows())
            .with_source("db-b", MockSource::failing("Lost connection to MySQL server"));
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.discover(&[instance("a", "db-a"), instance("b", "db-b")]);
        assert_eq!(registry.len(), 2);

        let emissions = Collector::new(registry).collect().await;
        assert_eq!(emissions.len(), 3);
        assert!(emissions.iter().all(|e| e.instance == "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_instance_does_not_block_others() {
        let connector = RecordingConnector::new()
            .with_source("db-a", three_rows())
            .with_source("db-b", three_rows().delayed(Duration::from_secs(3600)));
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.discover(&[instance("a", "db-a"), instance("b", "db-b")]);

        let collector = Collector::new(registry).with_query_timeout(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        let emissions = collector.collect().await;

        assert!(start.elapsed() < Duration::from_secs(3600));
        assert_eq!(emissions.len(), 3);
        assert!(emissions.iter().all(|e| e.instance == "a"));
    }

    #[tokio::test]
    async fn sleep_variant_emits_sleeping_sessions() {
        let connector = RecordingConnector::new().with_source("db-a", three_rows());
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.discover(&[instance("a", "db-a")]);

        let collector = Collector::new(registry).with_variant(MetricVariant::Sleep);
        let families = collector.gather().await.unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "mysqlsleepconn");
        assert_eq!(families[0].get_metric().len(), 1);
    }

    #[tokio::test]
    async fn repeated_scrapes_requery() {
        let source = three_rows();
        let connector = RecordingConnector::new().with_source("db-a", source.clone());
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.discover(&[instance("a", "db-a")]);

        let collector = Collector::new(registry);
        collector.collect().await;
        collector.collect().await;
        assert_eq!(source.fetch_count(), 2);
    }
}
