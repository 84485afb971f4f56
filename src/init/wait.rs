// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::error;

pub type BoxError = Box<dyn Error + Send + Sync>;

pub type TaskSet = JoinSet<(&'static str, Result<(), BoxError>)>;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out waiting for tasks to complete")]
    TimedOut,

    #[error("{task} failed: {source}")]
    Task {
        task: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Wait for the first task to finish, returning its name and result. An
/// empty set yields `None`.
pub async fn wait_for_any_task(tasks: &mut TaskSet) -> Option<(&'static str, Result<(), BoxError>)> {
    match tasks.join_next().await? {
        Ok(res) => Some(res),
        Err(e) => Some(("task", Err(e.into()))),
    }
}

pub async fn wait_for_tasks_with_timeout(
    tasks: &mut TaskSet,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_for_tasks_with_deadline(tasks, Instant::now() + timeout).await
}

/// Join every task before `stop_at`. The first task failure is returned once
/// the set is empty; a deadline miss wins over task failures.
pub async fn wait_for_tasks_with_deadline(
    tasks: &mut TaskSet,
    stop_at: Instant,
) -> Result<(), WaitError> {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => return Err(WaitError::TimedOut),
            Ok(None) => break,
            Ok(Some(Ok((_, Ok(()))))) => {}
            Ok(Some(Ok((task, Err(source))))) => {
                if result.is_ok() {
                    result = Err(WaitError::Task { task, source });
                }
            }
            Ok(Some(Err(e))) => error!("Failed to join with task: {:?}", e),
        }
    }

    result
}
