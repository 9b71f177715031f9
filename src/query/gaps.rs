use crate::query::timeseries::AggregatedPoint;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Turn sparse bucketed points into a dense series from `start` to `end` inclusive.
///
/// `step` advances a bucket boundary to the next one. Every walked boundary gets
/// the input point with exactly that timestamp, or a zero point. The walk stops
/// early if `step` fails to move forward. Pure and idempotent.
pub fn densify<F>(
    points: &[AggregatedPoint],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: F,
) -> Vec<AggregatedPoint>
where
    F: Fn(DateTime<Utc>) -> DateTime<Utc>,
{
    let by_time: HashMap<DateTime<Utc>, &AggregatedPoint> =
        points.iter().map(|p| (p.time, p)).collect();

    let mut dense = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        dense.push(
            by_time
                .get(&cursor)
                .map_or_else(|| AggregatedPoint::zero(cursor), |p| **p),
        );
        let next = step(cursor);
        if next <= cursor {
            break;
        }
        cursor = next;
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, 0, 0).unwrap()
    }

    fn point(time: DateTime<Utc>, count: u64) -> AggregatedPoint {
        AggregatedPoint {
            time,
            count,
            unique_visitors: count,
            bounce_rate: 0.5,
        }
    }

    fn next_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
        ts + TimeDelta::hours(1)
    }

    #[test]
    fn test_fills_missing_hours() {
        let sparse = vec![point(hour(1), 5), point(hour(3), 2)];
        let dense = densify(&sparse, hour(0), hour(3), next_hour);

        assert_eq!(dense.len(), 4);
        assert_eq!(dense[0], AggregatedPoint::zero(hour(0)));
        assert_eq!(dense[1], sparse[0]);
        assert_eq!(dense[2].count, 0);
        assert_eq!(dense[2].bounce_rate, 0.0);
        assert_eq!(dense[3], sparse[1]);
    }

    #[test]
    fn test_single_bucket() {
        let dense = densify(&[], hour(5), hour(5), next_hour);
        assert_eq!(dense, vec![AggregatedPoint::zero(hour(5))]);
    }

    #[test]
    fn test_start_after_end_is_empty() {
        assert!(densify(&[point(hour(2), 1)], hour(3), hour(2), next_hour).is_empty());
    }

    #[test]
    fn test_misaligned_points_are_dropped() {
        let off = hour(1) + TimeDelta::minutes(30);
        let dense = densify(&[point(off, 9)], hour(0), hour(2), next_hour);
        assert!(dense.iter().all(|p| p.count == 0));
    }

    #[test]
    fn test_stalled_step_terminates() {
        let dense = densify(&[], hour(0), hour(5), |ts| ts);
        assert_eq!(dense.len(), 1);
    }
}
