//! One streaming prediction session.
//!
//! ```text
//!   OPEN ──> STREAMING ──> CLOSING ──> CLOSED
//!    │           │            │
//!    └───────────┴────────────┴──────> FAILED
//! ```
//!
//! A session owns one model handle and talks to its connection through two
//! bounded queues. Requests are scored one at a time, so results leave in
//! arrival order. The first invalid request aborts the stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::daemon::protocol::ErrorCode;
use crate::error::{ServeError, StoreError};
use crate::inference::{self, PredictionRequest, PredictionResult};
use crate::model::{ModelHandle, ModelStore};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Open, Streaming | Failed) | (Streaming, Closing | Failed) | (Closing, Closed | Failed)
        )
    }
}

/// Items a connection feeds into a session.
#[derive(Debug)]
pub enum SessionInput {
    Predict {
        seq: u64,
        request: PredictionRequest,
    },
    End,
}

/// Items a session hands back to its connection.
#[derive(Debug)]
pub enum SessionOutput {
    Prediction { seq: u64, result: PredictionResult },
    Closed { served: u64 },
    Error(ServeError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Upper bound for a single inference call; `None` waits indefinitely.
    pub deadline: Option<Duration>,
}

/// Final report of a finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub id: u64,
    pub state: SessionState,
    pub served: u64,
    pub error: Option<ErrorCode>,
}

pub struct Session {
    id: u64,
    model: ModelHandle,
    state: SessionState,
    served: u64,
    options: SessionOptions,
}

impl Session {
    /// Bind a new session to `model` (or the store's default model).
    pub fn open(
        id: u64,
        store: &ModelStore,
        model: Option<&str>,
        options: SessionOptions,
    ) -> Result<Self, ServeError> {
        let handle = store.resolve(model).map_err(|e| {
            let reason = match e {
                StoreError::NotFound(name) => format!("model {name:?} is not loaded"),
                other => other.to_string(),
            };
            debug!(session = id, from = ?SessionState::Open, to = ?SessionState::Failed, %reason, "Session transition");
            ServeError::ModelUnavailable(reason)
        })?;

        info!(session = id, model = %handle.name(), "Session opened");
        Ok(Self {
            id,
            model: handle,
            state: SessionState::Open,
            served: 0,
            options,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(session = self.id, from = ?self.state, to = ?next, "Session transition");
        self.state = next;
    }

    /// Drive the session to a terminal state.
    ///
    /// Returns when the client sends `End`, the inbound queue closes, an
    /// error occurs, or `cancel` flips to `true`. The model handle is
    /// released when this future completes or is dropped.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Result<SessionInput, ServeError>>,
        outbound: mpsc::Sender<SessionOutput>,
        mut cancel: watch::Receiver<bool>,
    ) -> SessionOutcome {
        self.advance(SessionState::Streaming);

        let error = match self.stream(&mut inbound, &outbound, &mut cancel).await {
            Ok(()) => {
                self.advance(SessionState::Closing);
                // Results were pushed as they were produced; only the
                // terminator is left to flush.
                let closed = SessionOutput::Closed {
                    served: self.served,
                };
                match outbound.send(closed).await {
                    Ok(()) => {
                        self.advance(SessionState::Closed);
                        None
                    }
                    Err(_) => {
                        self.advance(SessionState::Failed);
                        Some(ErrorCode::Cancelled)
                    }
                }
            }
            Err(e) => {
                self.advance(SessionState::Failed);
                let code = e.code();
                match &e {
                    ServeError::InvalidArgument(_) | ServeError::Cancelled => {
                        debug!(session = self.id, error = %e, "Session aborted")
                    }
                    _ => warn!(session = self.id, error = %e, "Session failed"),
                }
                // Fails only when the writer is already gone.
                let _ = outbound.send(SessionOutput::Error(e)).await;
                Some(code)
            }
        };

        drop(inbound);
        info!(
            session = self.id,
            model = %self.model.name(),
            served = self.served,
            state = ?self.state,
            "Session finished"
        );
        SessionOutcome {
            id: self.id,
            state: self.state,
            served: self.served,
            error,
        }
    }

    async fn stream(
        &mut self,
        inbound: &mut mpsc::Receiver<Result<SessionInput, ServeError>>,
        outbound: &mpsc::Sender<SessionOutput>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ServeError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(ServeError::Cancelled),
                item = inbound.recv() => item,
            };

            let (seq, request) = match item {
                Some(Ok(SessionInput::Predict { seq, request })) => (seq, request),
                Some(Ok(SessionInput::End)) => return Ok(()),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ServeError::Transport(
                        "inbound stream closed before end of input".to_string(),
                    ));
                }
            };

            let result = self.score(request, cancel).await?;

            let sent = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(ServeError::Cancelled),
                sent = outbound.send(SessionOutput::Prediction { seq, result }) => sent,
            };
            if sent.is_err() {
                return Err(ServeError::Transport("outbound stream closed".to_string()));
            }
            self.served += 1;
        }
    }

    async fn score(
        &self,
        request: PredictionRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PredictionResult, ServeError> {
        let (k, threshold) = (request.k(), request.threshold());
        inference::validate(k, threshold)?;

        let model = Arc::clone(&self.model);
        let text = request.text;
        let task =
            tokio::task::spawn_blocking(move || inference::predict(&model, &text, k, threshold));
        let deadline = self.options.deadline;

        let joined = async move {
            let outcome = match deadline {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(ServeError::DeadlineExceeded(limit)),
                },
                None => task.await,
            };
            match outcome {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(ServeError::Internal("inference panicked".to_string())),
                Err(e) => Err(ServeError::Internal(format!("inference task failed: {e}"))),
            }
        };

        // A cancelled call lets the blocking task finish but drops its result.
        tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(ServeError::Cancelled),
            result = joined => result,
        }
    }
}

/// Resolves once the cancel flag is raised or its sender is gone.
///
/// The borrow of the watched value ends inside, so callers stay `Send`.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|flag| *flag).await;
}
