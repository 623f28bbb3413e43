//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存一致性机制，包括失效/更新决策、决策的派发和写入合并。

pub mod coalescer;
pub mod consistency;
pub mod decision;
