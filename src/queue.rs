//! Execution lane: one worker thread per connection that owns the engine
//! handle and runs submitted units strictly in submission order.
//!
//! Completions leave the lane through a [`Responder`]. Future-style callers
//! get a oneshot channel they await in their own context; callback-style
//! callers have their callback run on a separate delivery thread so the lane
//! can move on to the next unit right away. Rejected units reach their
//! callback through the same delivery thread, never the submitting one.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::mpsc;
use std::task::{Context, Poll};
use std::thread;

use futures::channel::oneshot;
use tracing::{debug, error, info, warn};

use crate::coordinator::TransactionCoordinator;
use crate::error::{engine_message, AccessError, Result};
use crate::value::{ExecutionResult, Task};

pub(crate) type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum Reply<T> {
    Future(oneshot::Sender<Result<T>>),
    Callback(Callback<T>, Delivery),
}

/// Completion slot for one submitted unit.
///
/// Answers exactly once: either through [`Responder::respond`], or with
/// [`AccessError::ConnectionClosed`] when dropped unanswered.
pub(crate) struct Responder<T: Send + 'static> {
    reply: Option<Reply<T>>,
}

impl<T: Send + 'static> Responder<T> {
    pub(crate) fn future() -> (Self, Completion<T>) {
        let (sender, receiver) = oneshot::channel();
        let responder = Self {
            reply: Some(Reply::Future(sender)),
        };
        (responder, Completion { receiver })
    }

    pub(crate) fn callback(callback: Callback<T>, delivery: Delivery) -> Self {
        Self {
            reply: Some(Reply::Callback(callback, delivery)),
        }
    }

    fn respond(mut self, result: Result<T>) {
        self.answer(result);
    }

    fn answer(&mut self, result: Result<T>) {
        match self.reply.take() {
            Some(Reply::Future(sender)) => {
                if sender.send(result).is_err() {
                    debug!("completion dropped by caller before delivery");
                }
            }
            Some(Reply::Callback(callback, delivery)) => {
                delivery.dispatch(move || callback(result))
            }
            None => {}
        }
    }
}

impl<T: Send + 'static> Drop for Responder<T> {
    fn drop(&mut self) {
        if self.reply.is_some() {
            self.answer(Err(AccessError::ConnectionClosed));
        }
    }
}

/// Pending result of a submitted unit.
///
/// Resolves once the lane has finished the unit. Resolves to
/// [`AccessError::ConnectionClosed`] if the lane stopped before running it.
#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Block the current thread until the unit completes.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(AccessError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) enum Message {
    Execute {
        task: Task,
        responder: Responder<ExecutionResult>,
    },
    Batch {
        tasks: Vec<Task>,
        responder: Responder<Vec<ExecutionResult>>,
    },
    Close {
        responder: Responder<()>,
    },
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs completion callbacks off the lane, one at a time in the order they
/// were dispatched. A panicking callback is logged and does not stop later
/// ones.
#[derive(Clone)]
pub(crate) struct Delivery {
    sender: mpsc::Sender<Job>,
}

impl Delivery {
    pub(crate) fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread_name = format!("{name}-delivery");
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for job in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(thread = %thread_name, "completion callback panicked");
                    }
                }
            })?;
        Ok(Self { sender })
    }

    fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let Err(mpsc::SendError(job)) = self.sender.send(Box::new(job)) else {
            return;
        };
        // Delivery thread is gone; never run user code on the lane or the caller.
        warn!("delivery thread unavailable, running callback on a detached thread");
        let spawned = thread::Builder::new()
            .name("sqlite-lane-delivery-fallback".to_string())
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("completion callback panicked");
                }
            });
        if let Err(err) = spawned {
            error!(error = %err, "unable to deliver completion callback");
        }
    }
}

/// Start the lane for `conn`. Returns the submission side of its queue.
pub(crate) fn spawn_lane(
    conn: rusqlite::Connection,
    name: &str,
) -> std::io::Result<mpsc::Sender<Message>> {
    let (sender, receiver) = mpsc::channel();
    let lane_name = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run_lane(conn, receiver, lane_name))?;
    Ok(sender)
}

fn run_lane(conn: rusqlite::Connection, receiver: mpsc::Receiver<Message>, name: String) {
    info!(lane = %name, "lane started");
    let mut close_responder = None;

    for message in receiver.iter() {
        match message {
            Message::Execute { task, responder } => {
                debug!(lane = %name, sql = %task.sql, "executing statement");
                let result = TransactionCoordinator::new(&conn).execute(&task);
                responder.respond(result);
            }
            Message::Batch { tasks, responder } => {
                debug!(lane = %name, statements = tasks.len(), "executing batch");
                let result = TransactionCoordinator::new(&conn).execute_batch(&tasks);
                responder.respond(result);
            }
            Message::Close { responder } => {
                close_responder = Some(responder);
                break;
            }
        }
    }

    // Anything still queued behind a close is answered by dropping it.
    drop(receiver);

    let closed = conn.close().map_err(|(_, err)| {
        let message = engine_message(&err);
        error!(lane = %name, error = %message, "failed to close database");
        AccessError::CloseFailed(message)
    });
    info!(lane = %name, "lane stopped");
    if let Some(responder) = close_responder {
        responder.respond(closed);
    }
}
