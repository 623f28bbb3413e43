//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 键到缓存层端点的稳定路由。

use murmur3::murmur3_32;

const SHARD_SEED: u32 = 0;

/// 根据键选择端点下标
///
/// 使用 murmur3，结果在进程重启和不同机器之间保持一致。端点数量变化时不做重分片。
pub fn shard_for(key: &[u8], endpoint_count: usize) -> usize {
    if endpoint_count <= 1 {
        return 0;
    }
    let mut source = key;
    let hash = murmur3_32(&mut source, SHARD_SEED).unwrap_or(0);
    hash as usize % endpoint_count
}
