use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use tracing::info;

use crate::config::SqliteConfig;
use crate::error::{engine_message, AccessError, Result};
use crate::provision::Provisioner;
use crate::queue::{spawn_lane, Callback, Completion, Delivery, Message, Responder};
use crate::value::{ExecutionResult, Task, Value};

/// Handle to one open database and its execution lane.
///
/// Cloning is cheap and every clone submits to the same lane, so a
/// connection can be shared between threads and tasks without locking.
/// Units run against the database strictly in the order they were
/// submitted. Submission returns immediately; results arrive through a
/// [`Completion`] or a callback.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    sender: mpsc::Sender<Message>,
    delivery: Delivery,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Provision the database called `name` and open it.
    pub async fn open(
        name: &str,
        provisioner: &dyn Provisioner,
        config: SqliteConfig,
    ) -> Result<Self> {
        let path = provisioner.provision(name).await?;
        Self::open_path(path, config)
    }

    /// Open the database at `path`, which must already be provisioned.
    pub fn open_path(path: impl AsRef<Path>, config: SqliteConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = rusqlite::Connection::open_with_flags(path, config.open_flags())
            .map_err(|err| AccessError::ConnectionOpenFailed(engine_message(&err)))?;
        info!(path = %path.display(), lane = %config.lane_name, "opened database");
        Self::start(conn, path.display().to_string(), config)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(config: SqliteConfig) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|err| AccessError::ConnectionOpenFailed(engine_message(&err)))?;
        Self::start(conn, ":memory:".to_string(), config)
    }

    fn start(conn: rusqlite::Connection, name: String, config: SqliteConfig) -> Result<Self> {
        config.apply(&conn)?;
        let delivery = Delivery::spawn(&config.lane_name).map_err(|err| {
            AccessError::ConnectionOpenFailed(format!("cannot start delivery thread: {err}"))
        })?;
        let sender = spawn_lane(conn, &config.lane_name).map_err(|err| {
            AccessError::ConnectionOpenFailed(format!("cannot start lane: {err}"))
        })?;
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                sender,
                delivery,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Path (or `:memory:`) this connection was opened on.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Queue one statement. Mutating statements run in their own exclusive
    /// transaction.
    pub fn execute(
        &self,
        sql: impl Into<String>,
        parameters: Option<Vec<Value>>,
    ) -> Completion<ExecutionResult> {
        self.submit(Task {
            sql: sql.into(),
            parameters,
        })
    }

    pub fn submit(&self, task: Task) -> Completion<ExecutionResult> {
        let (responder, completion) = Responder::future();
        self.send(Message::Execute { task, responder });
        completion
    }

    /// Queue `tasks` as one atomic transaction. Results come back in task
    /// order.
    pub fn execute_batch(&self, tasks: Vec<Task>) -> Completion<Vec<ExecutionResult>> {
        let (responder, completion) = Responder::future();
        self.send(Message::Batch { tasks, responder });
        completion
    }

    /// Callback form of [`Connection::execute`]. `on_complete` runs on the
    /// connection's delivery thread, never on the lane or the calling
    /// thread, including when the connection is already closed.
    pub fn execute_with<F>(
        &self,
        sql: impl Into<String>,
        parameters: Option<Vec<Value>>,
        on_complete: F,
    ) where
        F: FnOnce(Result<ExecutionResult>) + Send + 'static,
    {
        let task = Task {
            sql: sql.into(),
            parameters,
        };
        let responder = Responder::callback(
            Box::new(on_complete) as Callback<_>,
            self.shared.delivery.clone(),
        );
        self.send(Message::Execute { task, responder });
    }

    /// Callback form of [`Connection::execute_batch`].
    pub fn execute_batch_with<F>(&self, tasks: Vec<Task>, on_complete: F)
    where
        F: FnOnce(Result<Vec<ExecutionResult>>) + Send + 'static,
    {
        let responder = Responder::callback(
            Box::new(on_complete) as Callback<_>,
            self.shared.delivery.clone(),
        );
        self.send(Message::Batch { tasks, responder });
    }

    /// Stop accepting work, let everything already queued finish, then
    /// release the database handle.
    ///
    /// Closing twice resolves to [`AccessError::ConnectionClosed`].
    pub fn close(&self) -> Completion<()> {
        let (responder, completion) = Responder::future();
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            drop(responder);
            return completion;
        }
        // Bypasses the closed check in `send`.
        let _ = self.shared.sender.send(Message::Close { responder });
        completion
    }

    fn send(&self, message: Message) {
        if self.is_closed() {
            // Dropping the message answers its responder with ConnectionClosed.
            return;
        }
        let _ = self.shared.sender.send(message);
    }
}
