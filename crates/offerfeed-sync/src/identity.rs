use std::collections::HashMap;

use offerfeed_core::VariantKey;
use offerfeed_storage::sha256_hex;

/// Deterministic `{PREFIX}-{HASH}` identifiers with `-2`, `-3` suffixes on collision.
#[derive(Debug, Clone)]
pub struct IdentityAssigner {
    prefix: String,
    hash_len: usize,
}

impl IdentityAssigner {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim().to_uppercase(),
            hash_len: 12,
        }
    }

    pub fn with_hash_len(mut self, hash_len: usize) -> Self {
        self.hash_len = hash_len.clamp(1, 64);
        self
    }

    pub fn base_id(&self, key: &VariantKey) -> String {
        let digest = sha256_hex(key.normalized().as_bytes());
        format!("{}-{}", self.prefix, digest[..self.hash_len].to_uppercase())
    }

    /// Ids aligned with `keys`. The result for a given key does not depend on input order.
    pub fn assign(&self, keys: &[VariantKey]) -> Vec<String> {
        let mut order: Vec<(String, String, usize)> = keys
            .iter()
            .enumerate()
            .map(|(index, key)| (self.base_id(key), key.normalized(), index))
            .collect();
        order.sort();

        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut ids = vec![String::new(); keys.len()];
        for (base, _, index) in order {
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            ids[index] = if *count == 1 {
                base
            } else {
                format!("{base}-{count}")
            };
        }
        ids
    }
}
