use kube::api::GroupVersionKind;
use sha2::{Digest, Sha256};

const MAX_NAME_LENGTH: usize = 253;
const HASH_LENGTH: usize = 5;
const MAX_PREFIX_LENGTH: usize = MAX_NAME_LENGTH - HASH_LENGTH - 1;

/// Deterministic workload name for an owner object.
///
/// Different kinds with the same owner name get different hashes, so a JobSet and a Job
/// called `trainer` never collide.
pub fn workload_name_for_owner(owner_name: &str, owner_gvk: &GroupVersionKind) -> String {
    let mut prefixed = format!("{}-{}", owner_gvk.kind.to_lowercase(), owner_name);
    if prefixed.len() > MAX_PREFIX_LENGTH {
        let mut cut = MAX_PREFIX_LENGTH;
        while !prefixed.is_char_boundary(cut) {
            cut -= 1;
        }
        prefixed.truncate(cut);
    }

    let mut hasher = Sha256::new();
    hasher.update(owner_gvk.kind.as_bytes());
    hasher.update(b"\n");
    hasher.update(owner_gvk.group.as_bytes());
    hasher.update(b"\n");
    hasher.update(owner_name.as_bytes());
    let hash = hex::encode(hasher.finalize());

    format!("{}-{}", prefixed, &hash[..HASH_LENGTH])
}
