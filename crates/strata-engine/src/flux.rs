//! Flux step-machine
//!
//! Drives a caller-owned state through a closed, ordered set of steps.
//! Each step may have an async handler; steps without one are skipped, so a
//! machine can be positioned at any step and resume from there.
//!
//! ```text
//!   starting_at(step) ──► handler(step) ──Continue──► next step ... ──► Completed
//!                               │
//!                               ├──Completed──► Completed
//!                               ├──Abort──────► abort handler ──► Aborted
//!                               └──Err(e)─────► abort handler ──► Err(e)
//! ```
//!
//! The abort handler runs at most once, and no step handler runs after it.

use futures::future::BoxFuture;
use std::fmt;
use strata_common::{Error, Result};
use tracing::{debug, warn};

/// Closed, ordered set of steps
pub trait FluxStep: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every step, in execution order
    const ORDER: &'static [Self];

    fn name(&self) -> &'static str;

    /// Position of this step in [`ORDER`](Self::ORDER)
    fn position(&self) -> Option<usize> {
        Self::ORDER.iter().position(|step| step == self)
    }
}

/// Result of one step handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Proceed to the next step
    Continue,
    /// Stop and run the abort handler
    Abort,
    /// Stop successfully, skipping the remaining steps
    Completed,
}

/// Final result of a machine run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FluxOutcome {
    Completed,
    Aborted,
}

/// Why the abort handler was invoked
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortCause {
    /// A handler returned [`StepOutcome::Abort`]
    Requested,
    /// A handler failed with this error message
    Fault(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Running,
    Completed,
    Aborted,
}

type StepHandler<T> =
    Box<dyn for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<StepOutcome>> + Send + Sync>;

type AbortHandler<T> =
    Box<dyn for<'a> Fn(&'a mut T, AbortCause) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Step-machine over steps `S` and caller state `T`
pub struct Flux<S: FluxStep, T> {
    handlers: Vec<Option<StepHandler<T>>>,
    abort_handler: Option<AbortHandler<T>>,
    cursor: usize,
    status: Status,
    _steps: std::marker::PhantomData<S>,
}

impl<S: FluxStep, T: Send> Flux<S, T> {
    /// Machine positioned at the first step
    pub fn new() -> Self {
        Self {
            handlers: S::ORDER.iter().map(|_| None).collect(),
            abort_handler: None,
            cursor: 0,
            status: Status::Running,
            _steps: std::marker::PhantomData,
        }
    }

    /// Machine positioned at `step`; earlier steps never run
    pub fn starting_at(step: S) -> Self {
        let mut flux = Self::new();
        flux.cursor = step.position().unwrap_or(S::ORDER.len());
        flux
    }

    /// Register the handler for `step`, replacing any previous one
    pub fn when<F>(&mut self, step: S, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<StepOutcome>> + Send + Sync + 'static,
    {
        if let Some(slot) = step.position().and_then(|i| self.handlers.get_mut(i)) {
            *slot = Some(Box::new(handler));
        }
        self
    }

    /// Register the compensating handler
    pub fn when_abort<F>(&mut self, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut T, AbortCause) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.abort_handler = Some(Box::new(handler));
        self
    }

    /// Advance the cursor, or `None` once the machine has stopped
    pub fn next_step(&mut self) -> Option<S> {
        if self.status != Status::Running {
            return None;
        }
        match S::ORDER.get(self.cursor) {
            Some(step) => {
                self.cursor += 1;
                Some(*step)
            }
            None => {
                self.status = Status::Completed;
                None
            }
        }
    }

    /// Run the handler registered for `step` and apply its outcome
    pub async fn run_step(&mut self, step: S, state: &mut T) -> Result<StepOutcome> {
        match self.status {
            Status::Aborted => return Ok(StepOutcome::Abort),
            Status::Completed => return Ok(StepOutcome::Completed),
            Status::Running => {}
        }

        let Some(handler) = step
            .position()
            .and_then(|i| self.handlers.get(i))
            .and_then(Option::as_ref)
        else {
            debug!(step = step.name(), "No handler, skipping step");
            return Ok(StepOutcome::Continue);
        };

        debug!(step = step.name(), "Running step");
        match handler(state).await {
            Ok(StepOutcome::Continue) => Ok(StepOutcome::Continue),
            Ok(StepOutcome::Completed) => {
                self.status = Status::Completed;
                Ok(StepOutcome::Completed)
            }
            Ok(StepOutcome::Abort) => {
                debug!(step = step.name(), "Step requested abort");
                self.abort(state, AbortCause::Requested).await?;
                Ok(StepOutcome::Abort)
            }
            Err(e) => {
                warn!(step = step.name(), error = %e, "Step failed, aborting");
                if let Err(abort_err) = self.abort(state, AbortCause::Fault(e.to_string())).await {
                    warn!(error = %abort_err, "Abort handler failed");
                }
                Err(e)
            }
        }
    }

    async fn abort(&mut self, state: &mut T, cause: AbortCause) -> Result<()> {
        self.status = Status::Aborted;
        match &self.abort_handler {
            Some(handler) => handler(state, cause).await,
            None => Ok(()),
        }
    }

    /// Run every remaining step until the machine stops
    pub async fn run(&mut self, state: &mut T) -> Result<FluxOutcome> {
        while let Some(step) = self.next_step() {
            match self.run_step(step, state).await? {
                StepOutcome::Continue => {}
                StepOutcome::Completed => return Ok(FluxOutcome::Completed),
                StepOutcome::Abort => return Ok(FluxOutcome::Aborted),
            }
        }
        match self.status {
            Status::Aborted => Ok(FluxOutcome::Aborted),
            _ => Ok(FluxOutcome::Completed),
        }
    }

    /// Step the cursor points at, `None` once past the last
    pub fn current_step(&self) -> Option<S> {
        S::ORDER.get(self.cursor).copied()
    }

    pub fn is_aborted(&self) -> bool {
        self.status == Status::Aborted
    }

    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }
}

impl<S: FluxStep, T: Send> Default for Flux<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error for an aborted machine whose handler left no specific reason
pub fn aborted(step: impl FluxStep) -> Error {
    Error::Aborted(format!("aborted at step {}", step.name()))
}
