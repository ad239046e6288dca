//! Parallel job scheduler.
//!
//! Runs independent jobs concurrently while keeping the sum of their thread
//! weights under a fixed budget.

mod error;
mod job;
mod scheduler;

pub use error::{BoxError, JobError};
pub use job::{JobContext, JobFuture, JobTask};
pub use scheduler::{JobCounters, ParallelJobScheduler};

/// Files at least this large use parallel streams in automatic mode.
pub const PARALLEL_UPLOAD_MIN_SIZE: i64 = 80 * 1024 * 1024;

/// Bytes handled by one stream when sizing a parallel transfer.
pub const BYTES_PER_THREAD: i64 = 32 * 1024 * 1024;

/// Number of streams for a transfer of `size` bytes: one per 32 MiB,
/// at least 1 and at most `max_threads`.
pub fn threads_for_transfer(size: i64, max_threads: usize) -> usize {
    let max_threads = max_threads.max(1);
    let wanted = (size.max(0) + BYTES_PER_THREAD - 1) / BYTES_PER_THREAD;
    (wanted.max(1) as usize).min(max_threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_scale_with_size() {
        assert_eq!(threads_for_transfer(0, 4), 1);
        assert_eq!(threads_for_transfer(1, 4), 1);
        assert_eq!(threads_for_transfer(BYTES_PER_THREAD, 4), 1);
        assert_eq!(threads_for_transfer(BYTES_PER_THREAD + 1, 4), 2);
        assert_eq!(threads_for_transfer(PARALLEL_UPLOAD_MIN_SIZE, 4), 3);
        assert_eq!(threads_for_transfer(10 * 1024 * 1024 * 1024, 4), 4);
        assert_eq!(threads_for_transfer(10 * 1024 * 1024 * 1024, 0), 1);
    }
}
