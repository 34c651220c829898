//! Networked queue and lease storage backed by a Redis-compatible key/value
//! store. Grounded on the original's `RedisQueueStorage`/`RedisLeaseStorage`:
//! the priority queue is a sorted set scored by `(priority << 32) + id`
//! popped with `ZPOPMIN`, task bodies are plain string keys with a TTL, and a
//! lease is a single TTL'd key whose value is the owner id.

mod lease;
mod queue;

pub use lease::RedisLeaseStorage;
pub use queue::{RedisQueueStorage, DEFAULT_TASK_TTL};
