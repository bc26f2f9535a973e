//! Compensating actions for partially completed operations
//!
//! Every step that creates something pushes its undo. If the operation fails
//! the undos run newest first; an undo that fails is logged and the rest
//! still run, so the error the user sees is the original one.

use crate::error::Result;
use futures::future::BoxFuture;
use tracing::{debug, warn};

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Stack of undo closures for one operation
#[derive(Default)]
pub struct UndoStack {
    steps: Vec<(String, Undo)>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the undo of a step that just succeeded
    pub fn push<F>(&mut self, what: impl Into<String>, undo: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.steps.push((what.into(), Box::new(undo)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep everything; the operation succeeded
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Run all undos in reverse registration order
    pub async fn rollback(mut self) {
        let steps = std::mem::take(&mut self.steps);
        run_steps(steps).await;
    }

    /// Commit on `Ok`, roll back on `Err`; passes the result through
    pub async fn settle<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(e) => {
                debug!("rolling back {} step(s) after: {}", self.len(), e);
                self.rollback().await;
                Err(e)
            }
        }
    }
}

async fn run_steps(steps: Vec<(String, Undo)>) {
    for (what, undo) in steps.into_iter().rev() {
        match undo().await {
            Ok(()) => debug!("undid {}", what),
            Err(e) => warn!("cleanup of {} failed: {}", what, e),
        }
    }
}

impl Drop for UndoStack {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        // Dropped without settling, e.g. by a panic or a cancelled future.
        let steps = std::mem::take(&mut self.steps);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_steps(steps));
            }
            Err(_) => warn!("{} cleanup step(s) abandoned", steps.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CtlError;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str, fail: bool) -> impl FnOnce() -> BoxFuture<'static, Result<()>> {
        let log = log.clone();
        move || {
            async move {
                log.lock().unwrap().push(name.to_string());
                if fail {
                    Err(CtlError::internal("undo failed"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_rollback_reverse_and_tolerant() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut undo = UndoStack::new();
        undo.push("name", recorder(&log, "release name", false));
        undo.push("container", recorder(&log, "delete container", true));
        undo.push("snapshot", recorder(&log, "remove snapshot", false));

        let result: Result<()> = undo.settle(Err(CtlError::usage("boom"))).await;
        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["remove snapshot", "delete container", "release name"]
        );
    }

    #[tokio::test]
    async fn test_commit_keeps_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut undo = UndoStack::new();
        undo.push("name", recorder(&log, "release name", false));
        assert_eq!(undo.settle(Ok(7)).await.unwrap(), 7);
        assert!(log.lock().unwrap().is_empty());
    }
}
