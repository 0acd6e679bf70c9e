//! The three worker pools (§4.4): cooperative tasks, OS-thread blocking work, and a
//! semaphore-gated CPU-bound pool. Concurrency inside each pool is capped by a
//! [`tokio::sync::Semaphore`]; `tokio`'s own blocking-thread pool already recycles OS threads,
//! so the `Blocking`/`Cpu` pools differ only in how many permits they hand out.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounds how many cooperative tasks run concurrently; handlers on this pool must never block
/// the executing thread (§4.4).
#[derive(Clone)]
pub struct CooperativePool {
    semaphore: Arc<Semaphore>,
}

impl CooperativePool {
    pub fn new(concurrency: usize) -> Self {
        CooperativePool {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Spawns `fut` once a permit is free, returning a handle to the spawned task.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            fut.await
        })
    }
}

/// OS-thread pool for handlers that block (file IO, legacy sync clients). Backed by
/// `tokio::task::spawn_blocking`, gated by a semaphore so the executor's concurrency budget
/// (§5) is respected even though `spawn_blocking` itself has its own unbounded thread cap.
#[derive(Clone)]
pub struct BlockingPool {
    semaphore: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(concurrency: usize) -> Self {
        BlockingPool {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub async fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        tokio::task::spawn_blocking(f)
            .await
            .expect("blocking task panicked")
    }
}

/// CPU-bound pool (§4.4): same mechanism as [`BlockingPool`] but sized to the host's CPU
/// parallelism rather than to IO concurrency.
#[derive(Clone)]
pub struct CpuPool {
    inner: BlockingPool,
}

impl CpuPool {
    pub fn new(concurrency: usize) -> Self {
        CpuPool {
            inner: BlockingPool::new(concurrency),
        }
    }

    pub async fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.run(f).await
    }
}
