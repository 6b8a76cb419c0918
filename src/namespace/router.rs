//! Shard routing utilities

use serde_json::Value;

use crate::executor::helpers::key_string;

/// Router for determining shard assignments
pub struct ShardRouter;

impl ShardRouter {
    /// Route a key to a shard ID using seahash for uniform distribution
    ///
    /// seahash provides much better distribution than DefaultHasher for
    /// modulo operations on small numbers (like shard counts)
    pub fn route(key: &str, num_shards: u16) -> u16 {
        if num_shards == 0 {
            return 0;
        }

        let hash = seahash::hash(key.as_bytes());
        (hash % num_shards as u64) as u16
    }

    /// Route a primary key value. Keys that compare equal (`1` and `1.0`)
    /// land on the same shard.
    pub fn route_value(key: &Value, num_shards: u16) -> u16 {
        Self::route(&key_string(key), num_shards)
    }
}
