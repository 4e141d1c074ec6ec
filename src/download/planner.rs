//! Capability probe and deterministic segmentation.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use super::client::{HttpClient, ProbeResult};
use super::error::DownloadError;
use crate::model::{DownloadModel, Segment};

/// Inputs that shape a segment plan.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Upper bound on segments for one download.
    pub max_segments: u32,
    /// No segment (except the remainder carriers) is smaller than this.
    pub min_segment_size: u64,
    /// Directory under which each download gets its own temp directory.
    pub temp_root: PathBuf,
}

/// Probes sources and turns probe results into segment plans.
#[derive(Debug, Clone)]
pub struct SegmentPlanner {
    client: HttpClient,
    config: PlanConfig,
}

impl SegmentPlanner {
    /// Creates a planner over a shared client.
    #[must_use]
    pub fn new(client: HttpClient, config: PlanConfig) -> Self {
        Self { client, config }
    }

    /// Probes the model's source and stores the resulting plan on the model.
    ///
    /// # Errors
    ///
    /// Returns the raw probe error; the caller classifies and retries it.
    #[instrument(skip(self, model), fields(download_id = model.id))]
    pub async fn probe(&self, model: &mut DownloadModel) -> Result<(), DownloadError> {
        let result = self.client.probe(&model.source_url).await?;
        self.apply(model, result);
        Ok(())
    }

    /// Stores `result` and its segment plan on `model`.
    ///
    /// Identical probe results always give identical boundaries.
    pub fn apply(&self, model: &mut DownloadModel, result: ProbeResult) {
        if let (Some(expected), Some(probed)) = (model.expected_size, result.total_size)
            && expected != probed
        {
            warn!(
                download_id = model.id,
                expected,
                probed,
                "announced size differs from probed size, using probed size"
            );
        }

        let dir = download_temp_dir(&self.config.temp_root, model.id);
        let bounds: Vec<(u64, Option<u64>)> = match result.total_size {
            None => vec![(0, None)],
            Some(total) if !result.supports_ranges => vec![(0, Some(total))],
            Some(total) => {
                plan_ranges(total, self.config.max_segments, self.config.min_segment_size)
                    .into_iter()
                    .map(|(start, end)| (start, Some(end)))
                    .collect()
            }
        };

        model.total_size_bytes = result.total_size;
        model.supports_range_requests = result.supports_ranges && result.total_size.is_some();
        model.segments = bounds
            .into_iter()
            .zip(0u32..)
            .map(|((start, end), index)| {
                Segment::new(index, start, end, segment_temp_path(&dir, index))
            })
            .collect();

        info!(
            download_id = model.id,
            total_size = ?model.total_size_bytes,
            ranges = model.supports_range_requests,
            segments = model.segments.len(),
            "segment plan ready"
        );
    }
}

/// Splits `[0, total)` into contiguous half-open ranges.
///
/// `n = clamp(total / min_segment_size, 1, max_segments)`; the first
/// `total % n` ranges carry one extra byte. A zero-byte entity yields one
/// empty range.
#[must_use]
pub fn plan_ranges(total: u64, max_segments: u32, min_segment_size: u64) -> Vec<(u64, u64)> {
    let by_floor = total / min_segment_size.max(1);
    let count = by_floor.clamp(1, u64::from(max_segments.max(1)));

    let base = total / count;
    let remainder = total % count;

    let mut ranges = Vec::new();
    let mut cursor = 0u64;
    for i in 0..count {
        let len = base + u64::from(i < remainder);
        ranges.push((cursor, cursor + len));
        cursor += len;
    }
    ranges
}

/// Per-download temp directory: `<temp_root>/<id>`.
#[must_use]
pub fn download_temp_dir(temp_root: &Path, download_id: i64) -> PathBuf {
    temp_root.join(download_id.to_string())
}

fn segment_temp_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("seg-{index:04}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::model_with_bounds;

    const MIB: u64 = 1024 * 1024;

    fn planner(max_segments: u32) -> SegmentPlanner {
        SegmentPlanner::new(
            HttpClient::new().unwrap_or_else(|e| panic!("client: {e}")),
            PlanConfig {
                max_segments,
                min_segment_size: MIB,
                temp_root: PathBuf::from("/tmp/segfetch-test"),
            },
        )
    }

    #[test]
    fn test_ten_million_bytes_four_segments() {
        let ranges = plan_ranges(10_000_000, 4, MIB);
        assert_eq!(
            ranges,
            vec![
                (0, 2_500_000),
                (2_500_000, 5_000_000),
                (5_000_000, 7_500_000),
                (7_500_000, 10_000_000),
            ]
        );
    }

    #[test]
    fn test_small_file_gets_single_segment() {
        assert_eq!(plan_ranges(500_000, 8, MIB), vec![(0, 500_000)]);
    }

    #[test]
    fn test_floor_limits_segment_count() {
        let ranges = plan_ranges(3 * MIB + 10, 8, MIB);
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(|(s, e)| e - s >= MIB));
    }

    #[test]
    fn test_remainder_goes_to_first_segments() {
        let ranges = plan_ranges(10, 3, 1);
        assert_eq!(ranges, vec![(0, 4), (4, 7), (7, 10)]);
    }

    #[test]
    fn test_zero_bytes_single_empty_range() {
        assert_eq!(plan_ranges(0, 4, MIB), vec![(0, 0)]);
    }

    #[test]
    fn test_plans_are_contiguous_and_deterministic() {
        for total in [1, 7, MIB, 5 * MIB + 3, 97 * MIB + 11] {
            for max in [1, 2, 4, 16, 32] {
                let first = plan_ranges(total, max, MIB);
                assert_eq!(first, plan_ranges(total, max, MIB));
                assert_eq!(first[0].0, 0);
                assert_eq!(first.last().map(|r| r.1), Some(total));
                assert!(first.windows(2).all(|w| w[0].1 == w[1].0));
                assert!(first.len() <= max as usize);
            }
        }
    }

    #[tokio::test]
    async fn test_apply_ranged_probe_builds_indexed_plan() {
        let mut model = model_with_bounds(None, &[]);
        model.id = 42;
        planner(4).apply(
            &mut model,
            ProbeResult {
                total_size: Some(10_000_000),
                supports_ranges: true,
            },
        );

        assert!(model.supports_range_requests);
        assert_eq!(model.total_size_bytes, Some(10_000_000));
        assert_eq!(model.segments.len(), 4);
        assert!(model.has_valid_coverage());
        assert_eq!(
            model.segments[2].temp_file_path,
            PathBuf::from("/tmp/segfetch-test/42/seg-0002")
        );
    }

    #[tokio::test]
    async fn test_apply_without_ranges_is_serial() {
        let mut model = model_with_bounds(None, &[]);
        planner(4).apply(
            &mut model,
            ProbeResult {
                total_size: Some(10_000_000),
                supports_ranges: false,
            },
        );
        assert!(!model.supports_range_requests);
        assert_eq!(model.segments.len(), 1);
        assert_eq!(model.segments[0].range_end, Some(10_000_000));
    }

    #[tokio::test]
    async fn test_apply_unknown_size_is_open_ended() {
        let mut model = model_with_bounds(None, &[]);
        planner(4).apply(
            &mut model,
            ProbeResult {
                total_size: None,
                supports_ranges: false,
            },
        );
        assert_eq!(model.segments.len(), 1);
        assert_eq!(model.segments[0].range_end, None);
        assert!(model.has_valid_coverage());
    }
}
