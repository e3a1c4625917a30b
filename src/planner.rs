//! Batch planning: partition the record range into page-sized batches.
//!
//! The plan is a pure function of [`ServiceMetadata`]. The same metadata always yields the
//! same plan, which is what allows the consolidator to merge artifacts by index alone.

use crate::types::{Batch, BatchRange, ServiceMetadata};

/// Number of batches needed to cover `extent` records at `page_size` records per batch
pub fn batch_count(extent: u64, page_size: u64) -> usize {
    let page_size = page_size.max(1);
    extent.div_ceil(page_size) as usize
}

/// Partition `[0, metadata.extent())` into ascending, gap-free batches
///
/// Batch `i` covers `[i * max_page_size, min((i + 1) * max_page_size, extent))`.
/// An empty service yields an empty plan.
pub fn plan(metadata: &ServiceMetadata) -> Vec<Batch> {
    let extent = metadata.extent();
    let page_size = metadata.max_page_size.max(1);
    let count = batch_count(extent, page_size);

    let batches: Vec<Batch> = (0..count)
        .map(|index| {
            let start = index as u64 * page_size;
            let end = (start + page_size).min(extent);
            Batch::new(index, BatchRange { start, end })
        })
        .collect();

    tracing::debug!(
        service = %metadata.name,
        extent,
        page_size,
        batches = batches.len(),
        "Planned batches"
    );

    batches
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchStatus, OrderingKey};

    fn metadata(total_count: u64, max_page_size: u64) -> ServiceMetadata {
        ServiceMetadata {
            base_url: "https://example.com/layer/0".into(),
            name: "Parcels".into(),
            max_page_size,
            total_count,
            ordering_key: OrderingKey::Offset { order_by: None },
            geometry_type: None,
        }
    }

    fn assert_exact_cover(batches: &[Batch], extent: u64, page_size: u64) {
        let mut cursor = 0;
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index, i, "indices are 0-based and ascending");
            assert_eq!(batch.range.start, cursor, "no gap or overlap before batch {i}");
            assert!(batch.range.len() >= 1, "no empty batches");
            assert!(batch.range.len() <= page_size, "batch {i} exceeds page size");
            cursor = batch.range.end;
        }
        assert_eq!(cursor, extent, "union ends exactly at the extent");
    }

    #[test]
    fn plan_250_by_100_gives_three_batches() {
        let batches = plan(&metadata(250, 100));

        let sizes: Vec<u64> = batches.iter().map(|b| b.range.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(batches[2].range, BatchRange { start: 200, end: 250 });
        assert!(batches.iter().all(|b| b.status == BatchStatus::Pending));
        assert!(batches.iter().all(|b| b.attempts == 0));
    }

    #[test]
    fn plan_empty_service_has_no_batches() {
        assert!(plan(&metadata(0, 100)).is_empty());
    }

    #[test]
    fn plan_exact_multiple_has_no_short_tail() {
        let batches = plan(&metadata(300, 100));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].range.len(), 100);
    }

    #[test]
    fn plan_page_size_one() {
        let batches = plan(&metadata(5, 1));
        assert_eq!(batches.len(), 5);
        assert_exact_cover(&batches, 5, 1);
    }

    #[test]
    fn plan_covers_range_exactly_for_many_shapes() {
        for total in [0u64, 1, 2, 7, 99, 100, 101, 999, 1000, 1001, 12_345] {
            for page in [1u64, 2, 3, 10, 100, 1000, 10_000] {
                let batches = plan(&metadata(total, page));
                assert_eq!(batches.len(), batch_count(total, page));
                assert_exact_cover(&batches, total, page);
            }
        }
    }

    #[test]
    fn plan_is_deterministic() {
        let meta = metadata(1234, 77);
        assert_eq!(plan(&meta), plan(&meta));
    }

    #[test]
    fn plan_object_id_strategy_covers_id_span() {
        let meta = ServiceMetadata {
            ordering_key: OrderingKey::ObjectId {
                field: "OBJECTID".into(),
                min_oid: 1000,
                max_oid: 1249,
            },
            ..metadata(200, 100)
        };

        let batches = plan(&meta);

        assert_eq!(batches.len(), 3);
        assert_exact_cover(&batches, 250, 100);
    }

    #[test]
    fn batch_count_rounds_up() {
        assert_eq!(batch_count(0, 10), 0);
        assert_eq!(batch_count(1, 10), 1);
        assert_eq!(batch_count(10, 10), 1);
        assert_eq!(batch_count(11, 10), 2);
        assert_eq!(batch_count(5, 0), 5, "page size is clamped to 1");
    }
}
