//! Single-slot cancellation for in-flight operations.
//!
//! A [`RequestCanceller`] owns at most one live [`CancelToken`]. Minting a new
//! token aborts the previous one, so work started under an older token loses
//! its right to mutate shared state. Cancellation is cooperative: the token
//! only tells the owner to stop and discard results.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::Notify;

use crate::error::Cancelled;

#[derive(Debug)]
struct TokenInner {
    generation: u64,
    aborted: AtomicBool,
    notify: Notify,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    fn new(generation: u64) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                generation,
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        if !self.inner.aborted.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolves once the token is aborted.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `fut` under this token.
    ///
    /// Returns `Err(Cancelled)` if the token is aborted before `fut` finishes,
    /// or if it was aborted by the time the result is available.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        let output = tokio::select! {
            biased;
            _ = self.cancelled() => return Err(Cancelled),
            output = fut => output,
        };
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(output)
    }

    pub fn is_same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Default)]
pub struct RequestCanceller {
    current: Option<CancelToken>,
    generation: u64,
}

impl RequestCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh token, aborting the previous one.
    pub fn begin(&mut self) -> CancelToken {
        self.cancel_current();
        self.generation += 1;
        let token = CancelToken::new(self.generation);
        self.current = Some(token.clone());
        token
    }

    /// Aborts the current token, if any. Returns whether one was live.
    pub fn cancel_current(&mut self) -> bool {
        match self.current.take() {
            Some(token) => {
                let was_live = !token.is_cancelled();
                token.cancel();
                was_live
            }
            None => false,
        }
    }

    /// Forgets a finished token without aborting it.
    pub fn release(&mut self, token: &CancelToken) -> bool {
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.is_same(token))
        {
            self.current = None;
            return true;
        }
        false
    }

    pub fn owns(&self, token: &CancelToken) -> bool {
        !token.is_cancelled()
            && self
                .current
                .as_ref()
                .is_some_and(|current| current.is_same(token))
    }
}
