//! Serialized SQLite access with typed parameters and typed rows.
//!
//! # Intention
//!
//! - Give any number of callers safe access to one embedded SQLite database.
//! - Run every submitted statement or batch on a single lane per
//!   connection, in submission order, with mutating work wrapped in an
//!   exclusive transaction.
//! - Bind parameters from, and decode rows into, the closed [`Value`] type.
//!
//! # Architectural Boundaries
//!
//! - Only SQLite/database code belongs here.
//! - File provisioning is delegated to a [`Provisioner`]; the engine itself
//!   is `rusqlite`.
//! - No pooling, no migrations, no cancellation of in-flight work.
//!
//! # Example
//!
//! ```no_run
//! use rust_sqlite_lane::{Connection, SqliteConfig, Value};
//!
//! # async fn example() -> Result<(), rust_sqlite_lane::AccessError> {
//! let conn = Connection::open_in_memory(SqliteConfig::default())?;
//! conn.execute("CREATE TABLE t (id INTEGER, name TEXT)", None).await?;
//! conn.execute(
//!     "INSERT INTO t VALUES (?, ?)",
//!     Some(vec![Value::Integer(1), Value::from("a")]),
//! )
//! .await?;
//! let result = conn.execute("SELECT * FROM t", None).await?;
//! assert_eq!(result.rows().map(|rows| rows.len()), Some(1));
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod provision;
pub mod queue;
pub mod value;

pub use config::SqliteConfig;
pub use connection::Connection;
pub use coordinator::{TransactionCoordinator, TxState};
pub use error::{AccessError, Result};
pub use provision::{FixedPath, Provisioner, TemplateProvisioner};
pub use queue::Completion;
pub use value::{ExecutionResult, Row, Task, Value, ValueKind};
