//! Bounded pool of pre-constructed script contexts.
//!
//! A stack of `N` contexts guarded by a counting semaphore of weight `N`.
//! Acquire blocks until a permit is available or the caller is cancelled;
//! release re-creates the context before it is re-pooled. The stack plus
//! outstanding permits always account for exactly `N` contexts.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{HostApi, PolicyVm, VmError};

pub struct VmPool {
    stack: parking_lot::Mutex<Vec<PolicyVm>>,
    semaphore: Semaphore,
    size: usize,
}

impl VmPool {
    /// Pre-construct `size` contexts. Fails if any context cannot be built;
    /// a partially initialized pool is useless.
    pub fn new(size: usize, api: HostApi) -> Result<Arc<Self>, VmError> {
        let mut stack = Vec::with_capacity(size);
        for _ in 0..size {
            stack.push(PolicyVm::new(api.clone())?);
        }
        Ok(Arc::new(Self {
            stack: parking_lot::Mutex::new(stack),
            semaphore: Semaphore::new(size),
            size,
        }))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Take a context off the stack, blocking until one is free. Returns
    /// `None` when the supplied token is cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<PolicyVm> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return None,
            permit = self.semaphore.acquire() => permit,
        };
        // The semaphore never closes, so a permit is always granted.
        let permit = permit.expect("vm pool semaphore closed");
        permit.forget();

        let vm = self.stack.lock().pop();
        match vm {
            Some(vm) => Some(vm),
            // A permit guarantees a pooled context; an empty stack means the
            // pool invariant is broken and continuing would serve requests
            // with a corrupt pool.
            None => {
                error!("vm pool stack empty while holding a permit");
                std::process::exit(1);
            }
        }
    }

    /// Reset a context and return it to the stack. The reset is mandatory:
    /// a context that cannot be re-created is a fatal condition because the
    /// pool would otherwise shrink below its configured size.
    pub fn release(self: &Arc<Self>, mut vm: PolicyVm) {
        if let Err(err) = vm.recreate_context() {
            error!(error = %err, "failed to re-create vm context on release");
            std::process::exit(1);
        }
        self.stack.lock().push(vm);
        self.semaphore.add_permits(1);
    }

    /// Reset and re-pool on a background task so callers (e.g. an admission
    /// response in flight) are not blocked on the context reset.
    pub fn release_async(self: &Arc<Self>, vm: PolicyVm) {
        let pool = Arc::clone(self);
        tokio::task::spawn_blocking(move || pool.release(vm));
    }

    /// Contexts currently waiting in the stack (test observability).
    pub fn idle(&self) -> usize {
        self.stack.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn pool_holds_exactly_n_contexts() {
        let pool = VmPool::new(2, test_support::host_api()).unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(pool.idle(), 2);

        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.idle(), 0);

        // A third acquire must block until something is released.
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), pool.acquire(&cancel)).await;
        assert!(blocked.is_err(), "acquire should block on an empty pool");

        tokio::task::block_in_place(|| pool.release(a));
        let c = pool.acquire(&cancel).await.unwrap();

        tokio::task::block_in_place(|| {
            pool.release(b);
            pool.release(c);
        });
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_acquire_returns_none() {
        let pool = VmPool::new(1, test_support::host_api()).unwrap();
        let cancel = CancellationToken::new();

        let vm = pool.acquire(&cancel).await.unwrap();

        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire(&waiter_cancel).await.is_none() }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap(), "cancelled waiter must get None");

        tokio::task::block_in_place(|| pool.release(vm));
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn released_context_is_reset() {
        let pool = VmPool::new(1, test_support::host_api()).unwrap();
        let cancel = CancellationToken::new();

        let vm = pool.acquire(&cancel).await.unwrap();
        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout("dirty = true", "t", Duration::from_secs(5))
                .unwrap();
            pool.release(vm);
        });

        let vm = pool.acquire(&cancel).await.unwrap();
        tokio::task::block_in_place(|| {
            vm.run_script_with_timeout(
                "if dirty ~= nil then error('context not reset') end",
                "t",
                Duration::from_secs(5),
            )
            .unwrap();
            pool.release(vm);
        });
    }
}
