//! The consumer's exit flag and the signal handler that sets it.
//!
//! The handler task only flips the flag. The consumer loop observes it between
//! messages and does the commit and exit itself.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::SignalError;

/// Process-wide exit flag. Monotonic: once triggered it never resets.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// A flag with no signal attached; trigger it with [`ShutdownSignal::trigger`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a handler for `kind` on the current tokio runtime. The handler
    /// sets the flag when the signal arrives and does nothing else.
    pub fn trap(kind: SignalKind) -> Result<Self, SignalError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let shutdown = Self::new();

        let mut stream = signal(kind).map_err(|source| SignalError::Install {
            signal: kind.as_raw_value(),
            source,
        })?;

        let token = shutdown.token.clone();
        runtime.spawn(async move {
            if stream.recv().await.is_some() {
                info!(signal = kind.as_raw_value(), "received termination signal");
                token.cancel();
            }
        });

        Ok(shutdown)
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the flag is set, for async callers that want to wait on it.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}
