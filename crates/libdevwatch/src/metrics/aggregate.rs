use devwatch_protocol::{AggregatedMetric, Point, SeriesKey, TimeBucket};

/// Group timestamp-sorted points into epoch-aligned buckets and compute
/// statistics for each non-empty bucket.
pub(crate) fn bucketize(series: &SeriesKey, points: &[Point], interval: TimeBucket) -> Vec<AggregatedMetric> {
    let width = interval.width_ms();
    let mut out = Vec::new();
    let mut values = Vec::new();
    let mut current: Option<u64> = None;

    for p in points {
        let bucket = p.timestamp_ms - p.timestamp_ms % width;
        if current.is_some_and(|c| c != bucket) {
            out.extend(summarize(series, current, width, &mut values));
        }
        current = Some(bucket);
        values.push(p.value);
    }
    out.extend(summarize(series, current, width, &mut values));
    out
}

fn summarize(
    series: &SeriesKey,
    bucket_start: Option<u64>,
    width: u64,
    values: &mut Vec<f64>,
) -> Option<AggregatedMetric> {
    let start = bucket_start?;
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let count = values.len();
    let sum: f64 = values.iter().sum();
    let metric = AggregatedMetric {
        series: series.clone(),
        bucket_start_ms: start,
        bucket_end_ms: start + width,
        count,
        sum,
        avg: sum / count as f64,
        min: values[0],
        max: values[count - 1],
        median: median(values),
        p95: percentile(values, 95.0),
        p99: percentile(values, 99.0),
    };
    values.clear();
    Some(metric)
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Nearest-rank percentile over sorted, non-empty values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
