//! Structured fan-out/join.
//!
//! A [`TaskGroup`] only exists inside [`group`] (or [`group_with`]), which is
//! built on [`std::thread::scope`]: every forked task has terminated before
//! the call returns, so tasks may borrow freely from the caller's stack.
//! The first task to fail cancels the group's token; siblings that have not
//! started are skipped and running ones are expected to poll the token.

use crate::concurrency::CancelToken;
use crate::CoreError;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};
use thiserror::Error;
use tracing::{trace, warn};

pub type TaskResult = Result<(), CoreError>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Failed(Box<CoreError>),
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// The first failure observed in one fan-out.
#[derive(Debug, Error)]
#[error("{group}: task '{task}' failed: {source}")]
pub struct TaskFailure {
    pub group: String,
    pub task: String,
    pub source: TaskError,
}

impl TaskFailure {
    pub fn error(&self) -> Option<&CoreError> {
        match &self.source {
            TaskError::Failed(err) => Some(err),
            TaskError::Panicked(_) => None,
        }
    }

    /// Follow nested fan-outs down to the failure that started the chain.
    pub fn root(&self) -> &TaskFailure {
        match self.error() {
            Some(CoreError::Task(inner)) => inner.root(),
            _ => self,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.error().is_some_and(CoreError::is_cancellation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    index: usize,
    label: String,
}

impl TaskHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

pub struct TaskGroup<'scope, 'env: 'scope> {
    name: String,
    scope: &'scope Scope<'scope, 'env>,
    token: CancelToken,
    first_failure: Arc<Mutex<Option<TaskFailure>>>,
    handles: Vec<(TaskHandle, ScopedJoinHandle<'scope, ()>)>,
}

/// Run a fan-out with a fresh cancellation token.
pub fn group<'env, F>(name: &str, fork_all: F) -> TaskResult
where
    F: for<'scope> FnOnce(&mut TaskGroup<'scope, 'env>),
{
    group_with(name, None, fork_all)
}

/// Run a fan-out whose token is a child of `parent`, so cancelling the
/// parent also cancels this group.
pub fn group_with<'env, F>(name: &str, parent: Option<&CancelToken>, fork_all: F) -> TaskResult
where
    F: for<'scope> FnOnce(&mut TaskGroup<'scope, 'env>),
{
    let token = parent.map_or_else(CancelToken::new, CancelToken::child);
    thread::scope(|scope| {
        let mut group = TaskGroup {
            name: name.to_owned(),
            scope,
            token,
            first_failure: Arc::new(Mutex::new(None)),
            handles: Vec::new(),
        };
        fork_all(&mut group);
        group.join_and_check()
    })
}

impl<'scope, 'env> TaskGroup<'scope, 'env> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Start `task` on its own scoped thread.
    pub fn fork<F>(&mut self, label: impl Into<String>, task: F) -> TaskHandle
    where
        F: FnOnce(&CancelToken) -> TaskResult + Send + 'scope,
    {
        let handle = TaskHandle {
            index: self.handles.len(),
            label: label.into(),
        };
        let token = self.token.clone();
        let first_failure = Arc::clone(&self.first_failure);
        let group = self.name.clone();
        let task_label = handle.label.clone();

        let join = self.scope.spawn(move || {
            if token.is_cancelled() {
                trace!("{group}: skipping '{task_label}', group cancelled");
                return;
            }
            let source = match panic::catch_unwind(AssertUnwindSafe(|| task(&token))) {
                Ok(Ok(())) => return,
                Ok(Err(err)) => TaskError::Failed(Box::new(err)),
                Err(payload) => TaskError::Panicked(panic_message(payload.as_ref())),
            };
            record_failure(
                &first_failure,
                &token,
                TaskFailure {
                    group,
                    task: task_label,
                    source,
                },
            );
        });

        self.handles.push((handle.clone(), join));
        handle
    }

    /// Wait for every forked task, then report the first failure if any.
    ///
    /// A group whose token was cancelled from outside, with no task failing,
    /// reports `CoreError::Cancelled`: skipped tasks mean the work did not
    /// complete.
    fn join_and_check(self) -> TaskResult {
        let count = self.handles.len();
        for (handle, join) in self.handles {
            if join.join().is_err() {
                // Only reachable if the failure bookkeeping itself panicked.
                record_failure(
                    &self.first_failure,
                    &self.token,
                    TaskFailure {
                        group: self.name.clone(),
                        task: handle.label,
                        source: TaskError::Panicked("task thread aborted".to_owned()),
                    },
                );
            }
        }

        if let Some(failure) = self.first_failure.lock().take() {
            warn!("{failure}");
            return Err(CoreError::Task(failure));
        }
        if self.token.is_cancelled() {
            trace!("{}: cancelled after {count} tasks", self.name);
            return Err(CoreError::Cancelled);
        }
        trace!("{}: joined {count} tasks", self.name);
        Ok(())
    }
}

fn record_failure(slot: &Mutex<Option<TaskFailure>>, token: &CancelToken, failure: TaskFailure) {
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(failure);
        token.cancel();
    } else {
        trace!("{}: dropping later failure of '{}'", failure.group, failure.task);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
