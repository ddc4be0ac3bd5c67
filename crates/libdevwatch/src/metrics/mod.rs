//! Bounded-memory time-series store.
//!
//! Each `(container, metric)` series owns a ring buffer of raw points and a
//! streaming downsampler for live charts. Buffers keep arrival order; queries
//! work on timestamp-sorted copies so late points are handled correctly.

mod aggregate;
mod export;
mod lttb;

use dashmap::DashMap;
use devwatch_protocol::stream::topic;
use devwatch_protocol::{
    AggregatedMetric, AggregationQuery, DownsampledSeries, ExportFormat, MetricPoint, Point,
    SeriesKey, StreamEvent,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::broker::StreamingBroker;
use crate::config::MetricsConfig;
use crate::error::{DevwatchError, Result};
use crate::ring::RingBuffer;

pub use export::{ExportOptions, export_points};
pub use lttb::{StreamingDownsampler, lttb};

struct Series {
    buffer: RingBuffer<MetricPoint>,
    live: StreamingDownsampler,
    /// Bumped on every point.
    revision: u64,
}

/// Revisions of the selected series, read before their points were.
type Revisions = Vec<(SeriesKey, u64)>;

struct CachedAggregate {
    query: AggregationQuery,
    revisions: Revisions,
    computed_at: Instant,
    result: Vec<AggregatedMetric>,
}

impl CachedAggregate {
    fn selects(&self, key: &SeriesKey) -> bool {
        selects(&self.query, key)
    }
}

pub struct MetricsAggregator {
    config: MetricsConfig,
    broker: Arc<StreamingBroker>,
    series: DashMap<SeriesKey, Series>,
    cache: DashMap<String, CachedAggregate>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig, broker: Arc<StreamingBroker>) -> Self {
        Self {
            config,
            broker,
            series: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    pub fn add_point(&self, point: MetricPoint) {
        let key = point.series_key();
        {
            let mut series = self.series.entry(key.clone()).or_insert_with(|| Series {
                buffer: RingBuffer::new(self.config.series_capacity),
                live: StreamingDownsampler::new(self.config.live_view_points),
                revision: 0,
            });
            series.revision += 1;
            series.live.push(Point {
                timestamp_ms: point.timestamp_ms,
                value: point.value,
            });
            if series.buffer.push(point.clone()).is_some() {
                trace!(series = %key, "oldest point evicted");
            }
        }

        let ttl = self.config.cache_ttl();
        self.cache
            .retain(|_, cached| cached.computed_at.elapsed() < ttl && !cached.selects(&key));
        self.broker
            .publish(&topic::metrics(&point.container_id), StreamEvent::Metric(point));
    }

    pub fn add_points(&self, points: impl IntoIterator<Item = MetricPoint>) -> usize {
        points.into_iter().fold(0, |n, p| {
            self.add_point(p);
            n + 1
        })
    }

    /// Known series, sorted.
    pub fn series(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.series.iter().map(|s| s.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn point_count(&self, key: &SeriesKey) -> usize {
        self.series.get(key).map(|s| s.buffer.len()).unwrap_or(0)
    }

    /// Raw points in `[start_ms, end_ms]`, each series sorted by timestamp.
    /// An empty key list selects every series.
    pub fn raw_range(&self, keys: &[SeriesKey], start_ms: u64, end_ms: u64) -> Vec<MetricPoint> {
        self.resolve(keys)
            .iter()
            .flat_map(|key| self.sorted_range(key, start_ms, end_ms))
            .collect()
    }

    /// LTTB view of each series over `[start_ms, end_ms]`.
    pub fn downsampled(
        &self,
        keys: &[SeriesKey],
        start_ms: u64,
        end_ms: u64,
        max_points: usize,
    ) -> Vec<DownsampledSeries> {
        self.resolve(keys)
            .into_iter()
            .map(|key| {
                let points: Vec<Point> = self
                    .sorted_range(&key, start_ms, end_ms)
                    .iter()
                    .map(|p| Point {
                        timestamp_ms: p.timestamp_ms,
                        value: p.value,
                    })
                    .collect();
                DownsampledSeries {
                    points: lttb(&points, max_points),
                    series: key,
                }
            })
            .collect()
    }

    /// The incrementally maintained view for live charts.
    pub fn live_view(&self, key: &SeriesKey, max_points: usize) -> Option<Vec<Point>> {
        self.series.get(key).map(|s| s.live.view(max_points))
    }

    /// Bucketed statistics per series. Results are cached per query for the
    /// configured TTL and dropped when a selected series receives a point. A
    /// cached result is only served while every selected series is still at
    /// the revision it was computed from.
    pub fn aggregate(&self, query: &AggregationQuery) -> Result<Vec<AggregatedMetric>> {
        if query.start_ms > query.end_ms {
            return Err(DevwatchError::InvalidRequest(format!(
                "aggregation range is inverted: {} > {}",
                query.start_ms, query.end_ms
            )));
        }
        let signature = serde_json::to_string(query)
            .map_err(|e| DevwatchError::InvalidRequest(e.to_string()))?;
        let revisions = self.selected_revisions(query);
        if let Some(cached) = self.cache.get(&signature)
            && cached.computed_at.elapsed() < self.config.cache_ttl()
            && cached.revisions == revisions
        {
            trace!("aggregate cache hit");
            return Ok(cached.result.clone());
        }

        let result = self.compute_aggregate(query, &revisions);
        self.store_aggregate(signature, query, revisions, &result);
        Ok(result)
    }

    fn selected_revisions(&self, query: &AggregationQuery) -> Revisions {
        let mut revisions: Revisions = self
            .series
            .iter()
            .filter(|s| selects(query, s.key()))
            .map(|s| (s.key().clone(), s.revision))
            .collect();
        revisions.sort();
        revisions
    }

    fn compute_aggregate(&self, query: &AggregationQuery, revisions: &Revisions) -> Vec<AggregatedMetric> {
        let mut result = Vec::new();
        for (key, _) in revisions {
            let points: Vec<Point> = self
                .sorted_range(key, query.start_ms, query.end_ms)
                .iter()
                .map(|p| Point {
                    timestamp_ms: p.timestamp_ms,
                    value: p.value,
                })
                .collect();
            result.extend(aggregate::bucketize(key, &points, query.interval));
        }
        debug!(series = revisions.len(), buckets = result.len(), "aggregate computed");
        result
    }

    fn store_aggregate(
        &self,
        signature: String,
        query: &AggregationQuery,
        revisions: Revisions,
        result: &[AggregatedMetric],
    ) {
        self.cache.insert(
            signature,
            CachedAggregate {
                query: query.clone(),
                revisions,
                computed_at: Instant::now(),
                result: result.to_vec(),
            },
        );
    }

    pub fn export(
        &self,
        keys: &[SeriesKey],
        start_ms: u64,
        end_ms: u64,
        format: ExportFormat,
        opts: ExportOptions,
    ) -> Result<String> {
        export_points(&self.raw_range(keys, start_ms, end_ms), format, opts)
    }

    fn resolve(&self, keys: &[SeriesKey]) -> Vec<SeriesKey> {
        if keys.is_empty() {
            self.series()
        } else {
            keys.to_vec()
        }
    }

    fn sorted_range(&self, key: &SeriesKey, start_ms: u64, end_ms: u64) -> Vec<MetricPoint> {
        let Some(series) = self.series.get(key) else {
            return Vec::new();
        };
        let mut points: Vec<MetricPoint> = series
            .buffer
            .iter()
            .filter(|p| (start_ms..=end_ms).contains(&p.timestamp_ms))
            .cloned()
            .collect();
        drop(series);
        points.sort_by_key(|p| p.timestamp_ms);
        points
    }
}

fn selects(query: &AggregationQuery, key: &SeriesKey) -> bool {
    (query.container_ids.is_empty() || query.container_ids.contains(&key.container_id))
        && (query.metric_types.is_empty() || query.metric_types.contains(&key.metric_type))
}
