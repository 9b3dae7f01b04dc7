//! Supervisor for the long-running pieces of the service.
//!
//! Named processes run concurrently until a shutdown signal (SIGINT/SIGTERM)
//! arrives or one of them fails; closers then execute under a timeout. The
//! process exits 0 after a clean shutdown and 1 when a process failed.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A long-running unit of work driven by a cancellation token.
pub type Process = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// A cleanup function executed after every process has stopped.
pub type Closer = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

pub struct Runner {
    processes: Vec<(String, Process)>,
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

    /// Register a named process. If any process returns an error, every
    /// other process is cancelled.
    pub fn with_named_process<N, F, Fut>(mut self, name: N, process: F) -> Self
    where
        N: Into<String>,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Register a cleanup function. Closers run after all processes have
    /// stopped, regardless of how they stopped.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Override the root cancellation token, e.g. for tests.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run everything to completion, then exit the process.
    pub async fn run(self) -> ! {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                let result = process(process_token).await;
                (name, result)
            });
        }

        spawn_signal_handlers(token.clone());

        let mut failed = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "process completed");
                }
                Ok((name, Err(err))) => {
                    error!(process = %name, error = %format!("{:#}", err), "process failed");
                    failed = true;
                    token.cancel();
                }
                Err(err) => {
                    error!(error = %err, "process panicked");
                    failed = true;
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
                error!(timeout = ?self.closer_timeout, "closers timed out");
            }
        }

        if failed {
            error!("exiting after process failure");
            std::process::exit(1);
        }
        info!("exiting normally");
        std::process::exit(0)
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let interrupt_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received interrupt signal");
                interrupt_token.cancel();
            }
            Err(err) => {
                error!(error = %err, "failed to install interrupt handler");
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
            }
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }

    while let Some(joined) = closer_set.join_next().await {
        match joined {
            Ok(Ok(())) => debug!("closer completed"),
            Ok(Err(err)) => error!(error = %format!("{:#}", err), "closer failed"),
            Err(err) => error!(error = %err, "closer panicked"),
        }
    }
}
