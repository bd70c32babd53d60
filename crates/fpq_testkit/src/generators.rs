//! Property-based test generators using proptest.
//!
//! Provides strategies for payloads and for ways of splitting a stream of
//! payloads into push and pop transactions.

use bytes::Bytes;
use proptest::prelude::*;

/// Strategy for a single payload (arbitrary bytes, possibly empty).
pub fn payload_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..256).prop_map(Bytes::from)
}

/// Strategy for a stream of payloads that are distinct and tagged with
/// their position, so ordering checks can tell them apart.
pub fn tagged_payloads_strategy(max_len: usize) -> impl Strategy<Value = Vec<Bytes>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..max_len.max(2)).prop_map(
        |bodies| {
            bodies
                .into_iter()
                .enumerate()
                .map(|(i, body)| {
                    let mut payload = (i as u64).to_be_bytes().to_vec();
                    payload.extend(body);
                    Bytes::from(payload)
                })
                .collect()
        },
    )
}

/// Strategy for transaction sizes: a list of batch lengths in
/// `1..=max_batch`.
pub fn batch_sizes_strategy(max_batch: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1..=max_batch.max(1), 1..32)
}

/// Splits `items` into consecutive chunks following `sizes`, cycling
/// through the sizes until everything is assigned.
pub fn split_by_sizes<T: Clone>(items: &[T], sizes: &[usize]) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size_iter = sizes.iter().copied().filter(|&s| s > 0).cycle();
    while start < items.len() {
        let size = size_iter.next().unwrap_or(items.len());
        let end = (start + size).min(items.len());
        chunks.push(items[start..end].to_vec());
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn payloads_stay_small(payload in payload_strategy()) {
            prop_assert!(payload.len() < 256);
        }

        #[test]
        fn tagged_payloads_are_distinct(payloads in tagged_payloads_strategy(50)) {
            let mut unique = payloads.clone();
            unique.sort();
            unique.dedup();
            prop_assert_eq!(unique.len(), payloads.len());
        }

        #[test]
        fn split_preserves_items(
            items in prop::collection::vec(any::<u32>(), 0..100),
            sizes in batch_sizes_strategy(10),
        ) {
            let chunks = split_by_sizes(&items, &sizes);
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 10));
            let flat: Vec<u32> = chunks.into_iter().flatten().collect();
            prop_assert_eq!(flat, items);
        }
    }
}
