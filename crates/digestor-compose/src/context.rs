//! Per-run deadline and cancellation threaded through every I/O call.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ComposeError, ComposeResult};

/// Owner side of the cancellation signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn context(&self, op_timeout: Duration) -> RunContext {
        RunContext {
            op_timeout,
            cancel: Some(self.tx.subscribe()),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    op_timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl RunContext {
    /// A context that can time out but is never cancelled.
    pub fn detached(op_timeout: Duration) -> Self {
        Self {
            op_timeout,
            cancel: None,
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Run one suspension point under the deadline, aborting on cancellation.
    pub async fn guard<T, E, F>(&self, op: &'static str, fut: F) -> ComposeResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ComposeError>,
    {
        if self.is_cancelled() {
            return Err(ComposeError::Cancelled);
        }
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = wait_cancelled(cancel.as_mut()) => Err(ComposeError::Cancelled),
            res = tokio::time::timeout(self.op_timeout, fut) => match res {
                Ok(inner) => inner.map_err(Into::into),
                Err(_) => Err(ComposeError::Timeout {
                    op,
                    after: self.op_timeout,
                }),
            },
        }
    }
}

async fn wait_cancelled(rx: Option<&mut watch::Receiver<bool>>) {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
