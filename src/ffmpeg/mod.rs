//! C3: admission-controlled FFmpeg process pool.

pub mod pool;

pub use pool::{peek_sync_bytes, FfmpegPool, PoolError, ProcessHandle, ProcessTags, SpawnOutcome};
