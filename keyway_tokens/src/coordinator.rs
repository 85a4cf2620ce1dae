//! Single-flight coordination of re-authentication

use std::{
    error, fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;

use crate::{AccessTokenRef, TokenStore};

/// The published outcome of a re-authentication attempt
///
/// `None` while the attempt is still running.
type Outcome = Option<Result<(), ReauthError>>;

/// An error from a re-authentication attempt, shared with every caller that
/// waited on it
#[derive(Clone, Debug)]
pub enum ReauthError {
    /// The authentication procedure failed
    Failed(Arc<dyn error::Error + Send + Sync + 'static>),
    /// The caller running the attempt went away before it completed
    Abandoned,
}

impl fmt::Display for ReauthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(_) => f.write_str("re-authentication failed"),
            Self::Abandoned => f.write_str("re-authentication was abandoned before it completed"),
        }
    }
}

impl error::Error for ReauthError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Failed(source) => Some(&**source),
            Self::Abandoned => None,
        }
    }
}

/// Ensures that at most one re-authentication runs at a time
///
/// The first caller to request a re-authentication becomes its owner and runs
/// the authentication procedure. Callers that arrive while it is running wait
/// for the owner's outcome rather than starting their own attempt.
#[derive(Debug, Default)]
pub struct ReauthCoordinator {
    ongoing: Mutex<Option<watch::Receiver<Outcome>>>,
}

impl ReauthCoordinator {
    /// Constructs an idle coordinator
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<watch::Receiver<Outcome>>> {
        // The slot is only ever replaced wholesale, so a poisoned lock still
        // holds a consistent value.
        self.ongoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a re-authentication is currently running
    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    /// Waits for any running re-authentication to finish
    ///
    /// Returns immediately when none is running. The outcome of the attempt
    /// is not reported; read the token store afterwards.
    pub async fn wait_idle(&self) {
        let ongoing = self.slot().clone();
        if let Some(rx) = ongoing {
            tracing::trace!("waiting for in-flight re-authentication");
            let _ = wait_for_outcome(rx).await;
        }
    }

    /// Re-authenticates, or joins a re-authentication that is already running
    ///
    /// `previous` is the token that was rejected by the remote service. The
    /// owner of the attempt only calls `reauthenticate` if `store` still holds
    /// that token, or if no previous token is given. Otherwise another caller
    /// already replaced the rejected token and the attempt succeeds without
    /// doing anything.
    ///
    /// If `reauthenticate` fails, the error is handed to every waiter and the
    /// store is left as it was.
    pub async fn reauthenticate<F, Fut, E>(
        &self,
        store: &TokenStore,
        previous: Option<&AccessTokenRef>,
        reauthenticate: F,
    ) -> Result<(), ReauthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<Box<dyn error::Error + Send + Sync + 'static>>,
    {
        let in_flight = {
            let mut slot = self.slot();
            match &*slot {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Ok(InFlight {
                        coordinator: self,
                        tx: Some(tx),
                    })
                }
            }
        };

        let in_flight = match in_flight {
            Ok(in_flight) => in_flight,
            Err(rx) => {
                tracing::debug!("re-authentication already in flight, waiting for its outcome");
                return wait_for_outcome(rx).await;
            }
        };

        let still_current = previous.map_or(true, |previous| store.holds(previous));

        let outcome = if still_current {
            tracing::debug!("re-authenticating");
            reauthenticate().await.map_err(|error| {
                let error: Box<dyn error::Error + Send + Sync + 'static> = error.into();
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "re-authentication failed"
                );
                ReauthError::Failed(Arc::from(error))
            })
        } else {
            tracing::debug!(
                "token already replaced since it was rejected, skipping re-authentication"
            );
            Ok(())
        };

        in_flight.complete(outcome.clone());
        outcome
    }
}

async fn wait_for_outcome(mut rx: watch::Receiver<Outcome>) -> Result<(), ReauthError> {
    let outcome = match rx.wait_for(Option::is_some).await {
        Ok(published) => published.clone(),
        Err(_) => None,
    };

    outcome.unwrap_or(Err(ReauthError::Abandoned))
}

/// Ownership of the running attempt
///
/// Dropping it without completing marks the attempt as abandoned, so that
/// waiters are released even if the owner is cancelled.
struct InFlight<'a> {
    coordinator: &'a ReauthCoordinator,
    tx: Option<watch::Sender<Outcome>>,
}

impl InFlight<'_> {
    fn complete(mut self, outcome: Result<(), ReauthError>) {
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: Result<(), ReauthError>) {
        if let Some(tx) = self.tx.take() {
            let mut slot = self.coordinator.slot();
            tx.send_replace(Some(outcome));
            *slot = None;
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!("re-authentication abandoned before completion");
            self.publish(Err(ReauthError::Abandoned));
        }
    }
}
