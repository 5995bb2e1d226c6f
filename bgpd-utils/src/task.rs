//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use derive_new::new;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error};

/// A handle which can be used to manipulate the task created by the
/// [`Task::spawn`] and [`Task::spawn_cancellable`] functions.
///
/// By default, dropping this handle cancels the task (unless [`Task::detach`]
/// is used).
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

/// A handle which can be used to manipulate the timeout task created by the
/// [`TimeoutTask::new`] function.
///
/// Dropping this handle cancels the timeout task.
#[derive(Debug)]
pub struct TimeoutTask {
    inner: TimeoutTaskInner,
}

#[derive(Debug, new)]
struct TimeoutTaskInner {
    _task: Task<()>,
    control: UnboundedSender<Message>,
}

#[derive(Debug)]
enum Message {
    Reset(Option<Duration>),
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
            detached: false,
        }
    }

    /// Spawns a new asynchronous task that stops as soon as the provided
    /// cancellation token is cancelled.
    ///
    /// The task output is `None` when the task was cancelled before the
    /// future completed.
    pub fn spawn_cancellable<Fut>(
        token: CancellationToken,
        future: Fut,
    ) -> Task<Option<T>>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = future => Some(output),
            }
        })
    }

    /// Detach the task, meaning it will no longer be canceled if its handle is
    /// dropped.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Spawns a new task that will call the provided async closure when the
    /// specified timeout expires.
    ///
    /// Returns a handler that can be used to manipulate the timeout task.
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let task = Task::spawn(
            async move {
                let timeout_fut = tokio::time::sleep(timeout);
                tokio::pin!(timeout_fut);

                loop {
                    tokio::select! {
                        // Timeout has expired.
                        _ = &mut timeout_fut => {
                            (cb)().await;
                            break;
                        }
                        message = control_rx.recv() => {
                            let timeout = match message {
                                // Timeout has been refreshed/updated.
                                Some(Message::Reset(None)) => timeout,
                                Some(Message::Reset(Some(new_timeout))) => {
                                    new_timeout
                                }
                                // Timeout has been aborted.
                                None => break,
                            };
                            let next = Instant::now() + timeout;
                            timeout_fut.as_mut().reset(next);
                        }
                    }
                }
            }
            .in_current_span(),
        );

        TimeoutTask {
            inner: TimeoutTaskInner::new(task, control_tx),
        }
    }

    /// Resets the timeout, as long as it hasn't expired yet.
    ///
    /// If a new timeout value isn't specified, the last value will be reused.
    pub fn reset(&mut self, timeout: Option<Duration>) {
        if self.inner.control.send(Message::Reset(timeout)).is_err() {
            error!("failed to reset timeout");
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_child = fired.clone();
        let timeout =
            TimeoutTask::new(Duration::from_secs(5), move || async move {
                fired_child.store(true, Ordering::SeqCst);
            });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        drop(timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reset_postpones_expiry() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_child = fired.clone();
        let mut timeout =
            TimeoutTask::new(Duration::from_secs(5), move || async move {
                fired_child.store(true, Ordering::SeqCst);
            });

        tokio::time::sleep(Duration::from_secs(4)).await;
        timeout.reset(Some(Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_timeout_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_child = fired.clone();
        let timeout =
            TimeoutTask::new(Duration::from_secs(1), move || async move {
                fired_child.store(true, Ordering::SeqCst);
            });
        drop(timeout);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellable_task_stops_on_cancel() {
        let token = CancellationToken::new();
        let task = Task::spawn_cancellable(
            token.clone(),
            std::future::pending::<()>(),
        );
        token.cancel();
        assert_eq!(task.await.unwrap(), None);
    }
}
