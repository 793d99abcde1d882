// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded worker pool used for broadcast fan-out.
//!
//! Jobs are spawned on a [`TaskTracker`] and run once they hold a permit from the pool
//! semaphore, so at most `size` jobs execute concurrently. Stopping the pool closes the
//! semaphore: queued jobs fail with [`NetError::Shutdown`] instead of running.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::trace;

use crate::error::{NetError, NetResult};

#[derive(Clone)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    pub fn spawn<F, T>(&self, job: F) -> JoinHandle<NetResult<T>>
    where
        F: Future<Output = NetResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| NetError::Shutdown)?;
            job.await
        })
    }

    /// Refuse new work. Jobs already holding a permit run to completion.
    pub fn stop(&self) {
        trace!(target: "fleet_tasknet::pool", "stopping worker pool");
        self.permits.close();
        self.tracker.close();
    }

    /// Wait for every spawned job to finish. Only returns after [`stop`](Self::stop).
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_stopped_pool_rejects_jobs() {
        let pool = WorkerPool::new(1);
        pool.stop();
        assert!(pool.permits.is_closed());

        let result = pool.spawn(async { Ok(1) }).await.unwrap();
        assert!(matches!(result, Err(NetError::Shutdown)));
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_queued_jobs_fail_after_stop() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let running = pool.spawn(async move {
            let _ = release_rx.await;
            Ok("ran")
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = pool.spawn(async { Ok("queued") });

        pool.stop();
        let _ = release_tx.send(());

        assert_eq!(running.await.unwrap().unwrap(), "ran");
        assert!(matches!(queued.await.unwrap(), Err(NetError::Shutdown)));
        pool.wait().await;
    }
}
