//! Largest-Triangle-Three-Buckets downsampling.

use devwatch_protocol::Point;

/// Reduce `points` (sorted by timestamp) to `threshold` points that keep the
/// visual shape of the series.
///
/// The first and last points are always kept. Each of the `threshold - 2`
/// inner buckets contributes the point forming the largest triangle with the
/// previously selected point and the average of the next bucket.
///
/// Edge cases: `threshold >= len` returns the input unchanged, `0` returns
/// nothing, `1` returns the most recent point and `2` returns the endpoints.
pub fn lttb(points: &[Point], threshold: usize) -> Vec<Point> {
    let n = points.len();
    if threshold >= n {
        return points.to_vec();
    }
    match threshold {
        0 => return Vec::new(),
        1 => return vec![points[n - 1]],
        2 => return vec![points[0], points[n - 1]],
        _ => {}
    }

    let every = (n - 2) as f64 / (threshold - 2) as f64;
    let mut sampled = Vec::with_capacity(threshold);
    sampled.push(points[0]);
    let mut anchor = 0usize;

    for bucket in 0..threshold - 2 {
        let next_start = bucket_edge(bucket + 1, every).min(n - 1);
        let next_end = bucket_edge(bucket + 2, every).clamp(next_start + 1, n);
        let (avg_x, avg_y) = centroid(&points[next_start..next_end]);

        let start = bucket_edge(bucket, every);
        let end = bucket_edge(bucket + 1, every).clamp(start + 1, n - 1);
        let a = points[anchor];
        let (ax, ay) = (a.timestamp_ms as f64, a.value);

        let mut best = start;
        let mut best_area = -1.0;
        for (offset, p) in points[start..end].iter().enumerate() {
            let area = ((ax - avg_x) * (p.value - ay) - (ax - p.timestamp_ms as f64) * (avg_y - ay))
                .abs()
                * 0.5;
            if area > best_area {
                best_area = area;
                best = start + offset;
            }
        }
        sampled.push(points[best]);
        anchor = best;
    }

    sampled.push(points[n - 1]);
    sampled
}

fn bucket_edge(bucket: usize, every: f64) -> usize {
    (bucket as f64 * every).floor() as usize + 1
}

fn centroid(points: &[Point]) -> (f64, f64) {
    let len = points.len().max(1) as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| {
        (sx + p.timestamp_ms as f64, sy + p.value)
    });
    (sx / len, sy / len)
}

/// Incrementally maintained subsample for live charts.
///
/// Holds at most twice the target; on overflow the held points are reduced
/// back to the target with [`lttb`], so each push is amortised O(1) and a
/// chart never re-downsamples the full history.
#[derive(Debug, Clone)]
pub struct StreamingDownsampler {
    target: usize,
    points: Vec<Point>,
}

impl StreamingDownsampler {
    pub fn new(target: usize) -> Self {
        let target = target.max(2);
        Self {
            target,
            points: Vec::with_capacity(target * 2),
        }
    }

    pub fn push(&mut self, point: Point) {
        match self.points.last() {
            Some(last) if last.timestamp_ms > point.timestamp_ms => {
                let at = self
                    .points
                    .partition_point(|p| p.timestamp_ms <= point.timestamp_ms);
                self.points.insert(at, point);
            }
            _ => self.points.push(point),
        }
        if self.points.len() > self.target * 2 {
            self.points = lttb(&self.points, self.target);
        }
    }

    /// Current view reduced to at most `max_points`.
    pub fn view(&self, max_points: usize) -> Vec<Point> {
        lttb(&self.points, max_points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
