use std::future::Future;
use tokio::task::JoinSet;

use crate::backend::BackendError;

/// Aggregator for fire-and-forget asynchronous backend requests.
///
/// Each request is spawned as a task; `wait_all` blocks until the
/// outstanding count reaches zero and returns the accumulated failures.
pub struct CompletionSet {
    tasks: JoinSet<Result<(), BackendError>>,
}

impl CompletionSet {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every outstanding request and collect the failures.
    pub async fn wait_all(&mut self) -> Vec<BackendError> {
        let mut failures = Vec::new();
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(join_err) => {
                    failures.push(BackendError::failed("task", "<aggregate>", join_err))
                }
            }
        }
        failures
    }
}

impl Default for CompletionSet {
    fn default() -> Self {
        Self::new()
    }
}
