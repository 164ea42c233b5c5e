//! Runner for long-lived worker processes with graceful shutdown.
//!
//! Named app processes run concurrently until one fails or a SIGTERM/SIGINT
//! arrives; the cancellation token then asks every process to stop, and the
//! runner waits for all of them to drain rather than aborting them, so work
//! that must finish (an in-flight dispatch/checkpoint pair, say) can.
//! Closers execute afterwards under a timeout, and the process exits
//! non-zero when any app process failed.
//!
//! # Example
//!
//! ```no_run
//! use bidwatch_runner::Runner;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_named_process(
//!             "heartbeat",
//!             Box::new(|ctx| {
//!                 Box::pin(async move {
//!                     ctx.cancelled().await;
//!                     Ok(())
//!                 })
//!             }),
//!         )
//!         .with_closer(|| async {
//!             tracing::info!("cleaning up");
//!             Ok(())
//!         })
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// An app process: takes the shutdown token, runs until done or cancelled.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// A cleanup function executed after every app process has stopped.
pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

pub struct Runner {
    processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Adds a named app process. The name appears in lifecycle logs.
    pub fn with_named_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.processes.push((name.into(), process));
        self
    }

    /// Adds a closer. Closers run after all app processes have stopped,
    /// regardless of how they stopped, and every closer runs even when
    /// others fail.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    /// Sets the timeout for executing closers. Default is 10 seconds.
    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Sets a custom cancellation token, allowing external shutdown control.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Runs every app process to completion, then the closers, then exits
    /// the process: zero when everything stopped cleanly, non-zero when any
    /// app process failed.
    pub async fn run(self) {
        match self.execute().await {
            Some(err) => {
                error!("application exiting with error: {:#}", err);
                std::process::exit(1);
            }
            None => {
                info!("application exiting normally");
                std::process::exit(0);
            }
        }
    }

    async fn execute(self) -> Option<anyhow::Error> {
        let token = self.cancellation_token.clone();
        let mut join_set = JoinSet::new();

        for (name, process) in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                let result = process(process_token).await;
                (name, result)
            });
        }

        spawn_signal_handlers(token.clone());

        // Drain every process. The first failure cancels the rest, but they
        // are joined, not aborted, so each can finish its current unit of
        // work before observing the token.
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "app process completed");
                }
                Ok((name, Err(err))) => {
                    error!(process = %name, "app process error: {:#}", err);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    token.cancel();
                }
                Err(err) => {
                    error!("app process panicked: {}", err);
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("app process panicked: {err}"));
                    }
                    token.cancel();
                }
            }
        }

        if !self.closers.is_empty() {
            info!(timeout = ?self.closer_timeout, "running closers");
            if tokio::time::timeout(self.closer_timeout, run_closers(self.closers))
                .await
                .is_err()
            {
                error!("closers timed out after {:?}", self.closer_timeout);
            }
        }

        first_error
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let interrupt_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                interrupt_token.cancel();
            }
            Err(err) => {
                error!("error setting up signal handler: {}", err);
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM signal");
                token.cancel();
            }
            Err(err) => {
                error!("error setting up SIGTERM handler: {}", err);
            }
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => debug!("closer completed"),
            Ok(Err(err)) => error!("closer error: {:#}", err),
            Err(err) => error!("closer panicked: {}", err),
        }
    }
}
