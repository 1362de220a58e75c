use std::collections::BTreeMap;

/// Merges `other` into `first`; on a key conflict the value already in `first` is kept.
pub fn merge_keep_first<K: Ord + Clone, V: Clone>(
    mut first: BTreeMap<K, V>,
    other: &BTreeMap<K, V>,
) -> BTreeMap<K, V> {
    for (k, v) in other {
        first.entry(k.clone()).or_insert_with(|| v.clone());
    }
    first
}
