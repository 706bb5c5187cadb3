//! Transaction coordinator.
//!
//! Every mutating statement runs inside `BEGIN EXCLUSIVE` / `COMMIT`. A
//! failure anywhere rolls the whole unit back and surfaces one
//! [`AccessError::TransactionFailed`]; the caller never sees a half-applied
//! batch.

use rusqlite::{Connection, Statement};
use tracing::{debug, warn};

use crate::binder;
use crate::decoder;
use crate::error::{engine_message, AccessError, Result};
use crate::value::{ExecutionResult, Task};

const BEGIN: &str = "BEGIN EXCLUSIVE TRANSACTION";
const COMMIT: &str = "COMMIT TRANSACTION";
const ROLLBACK: &str = "ROLLBACK TRANSACTION";

/// Leading keywords of statements that open, end or nest transactions.
/// The coordinator owns transaction boundaries, so tasks may not issue these.
const TRANSACTION_CONTROL: [&str; 6] = ["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Begun,
    Committed,
    RolledBack,
}

/// Runs tasks against one engine handle. Owned by the lane for the duration
/// of a single unit.
pub struct TransactionCoordinator<'conn> {
    conn: &'conn Connection,
    state: TxState,
}

impl<'conn> TransactionCoordinator<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            state: TxState::Idle,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Run a single statement.
    ///
    /// Binding is validated before a transaction is opened, so parameter
    /// errors come back as-is with the engine untouched. Read-only
    /// statements skip the transaction.
    pub fn execute(&mut self, task: &Task) -> Result<ExecutionResult> {
        reject_transaction_control(0, &task.sql)?;
        let mut statement =
            binder::prepare(self.conn, &task.sql).map_err(|err| AccessError::statement(0, &err))?;
        binder::bind(&mut statement, task.parameters())?;

        if statement.readonly() {
            debug!(sql = %task.sql, "running read-only statement outside a transaction");
            let outcome = run_statement(&mut statement);
            drop(statement);
            if !self.conn.is_autocommit() {
                let cause = AccessError::StatementFailed {
                    index: 0,
                    message: "statement left a transaction open".to_string(),
                };
                return Err(self.abort(cause, Some(0)));
            }
            return outcome.map_err(|err| AccessError::statement(0, &err));
        }

        self.begin()?;
        let outcome = run_statement(&mut statement);
        drop(statement);
        match outcome {
            Ok(result) => {
                self.commit()?;
                Ok(result)
            }
            Err(err) => Err(self.abort(AccessError::statement(0, &err), Some(0))),
        }
    }

    /// Run `tasks` in order as one atomic unit.
    ///
    /// Statements are prepared one at a time inside the transaction, so a
    /// task may depend on schema created by an earlier task in the same
    /// batch. The first failure stops the batch.
    pub fn execute_batch(&mut self, tasks: &[Task]) -> Result<Vec<ExecutionResult>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        self.begin()?;

        let mut results = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            match self.run_task(index, task) {
                Ok(_) if self.conn.is_autocommit() => {
                    let cause = AccessError::StatementFailed {
                        index,
                        message: "statement ended the enclosing transaction".to_string(),
                    };
                    return Err(self.abort(cause, Some(index)));
                }
                Ok(result) => results.push(result),
                Err(cause) => return Err(self.abort(cause, Some(index))),
            }
        }

        self.commit()?;
        Ok(results)
    }

    fn run_task(&self, index: usize, task: &Task) -> Result<ExecutionResult> {
        reject_transaction_control(index, &task.sql)?;
        let mut statement = binder::prepare(self.conn, &task.sql)
            .map_err(|err| AccessError::statement(index, &err))?;
        binder::bind(&mut statement, task.parameters())?;
        run_statement(&mut statement).map_err(|err| AccessError::statement(index, &err))
    }

    fn begin(&mut self) -> Result<()> {
        // At most one transaction per handle.
        if !self.conn.is_autocommit() {
            return Err(AccessError::TransactionStartFailed(
                "a transaction is already open on this connection".to_string(),
            ));
        }
        self.conn
            .execute_batch(BEGIN)
            .map_err(|err| AccessError::TransactionStartFailed(engine_message(&err)))?;
        self.transition(TxState::Begun);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        match self.conn.execute_batch(COMMIT) {
            Ok(()) => {
                self.transition(TxState::Committed);
                self.transition(TxState::Idle);
                Ok(())
            }
            Err(err) => Err(self.abort(AccessError::CommitFailed(engine_message(&err)), None)),
        }
    }

    /// Roll back and wrap `cause`. A failing rollback is logged and attached
    /// but never replaces the original cause.
    fn abort(&mut self, cause: AccessError, index: Option<usize>) -> AccessError {
        warn!(error = %cause, ?index, "rolling back transaction");
        let rollback_error = match self.conn.execute_batch(ROLLBACK) {
            Ok(()) => None,
            Err(err) => {
                let message = engine_message(&err);
                warn!(error = %message, "rollback failed");
                Some(message)
            }
        };
        self.transition(TxState::RolledBack);
        self.transition(TxState::Idle);
        AccessError::TransactionFailed {
            cause: Box::new(cause),
            index,
            rollback_error,
        }
    }

    fn transition(&mut self, next: TxState) {
        debug!(from = ?self.state, to = ?next, "transaction state");
        self.state = next;
    }
}

fn reject_transaction_control(index: usize, sql: &str) -> Result<()> {
    if is_transaction_control(sql) {
        return Err(AccessError::StatementFailed {
            index,
            message: "transaction control statements are not allowed".to_string(),
        });
    }
    Ok(())
}

/// Whether the first keyword of `sql`, after whitespace and comments, is a
/// transaction control keyword.
fn is_transaction_control(sql: &str) -> bool {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }
    let keyword = rest
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    TRANSACTION_CONTROL
        .iter()
        .any(|control| keyword.eq_ignore_ascii_case(control))
}

/// Step a bound statement to completion. Statements that produce columns
/// yield their rows; everything else reports the engine's change count.
fn run_statement(statement: &mut Statement<'_>) -> rusqlite::Result<ExecutionResult> {
    if statement.column_count() == 0 {
        let changed = statement.raw_execute()?;
        return Ok(ExecutionResult::AffectedCount(changed as u64));
    }

    let columns = decoder::column_names(statement);
    let mut rows = statement.raw_query();
    let mut decoded = Vec::new();
    while let Some(row) = rows.next()? {
        decoded.push(decoder::decode_row(row, &columns)?);
    }
    Ok(ExecutionResult::RowSet(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE a (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE b (id INTEGER PRIMARY KEY, code TEXT UNIQUE NOT NULL);
             INSERT INTO b (code) VALUES ('taken');",
        )
        .unwrap();
        conn
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn write_reports_affected_count_and_commits() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let result = coordinator
            .execute(&Task::new("INSERT INTO a (name) VALUES (?)").with_parameter("x"))
            .unwrap();
        assert_eq!(result, ExecutionResult::AffectedCount(1));
        assert_eq!(coordinator.state(), TxState::Idle);
        assert!(conn.is_autocommit());
        assert_eq!(count(&conn, "a"), 1);
    }

    #[test]
    fn select_returns_rows() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let result = coordinator
            .execute(&Task::new("SELECT id, code FROM b"))
            .unwrap();
        let rows = result.into_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("code"), Some(&Value::Text("taken".into())));
    }

    #[test]
    fn bind_errors_on_single_statements_are_not_wrapped() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let err = coordinator
            .execute(&Task::new("INSERT INTO a (id, name) VALUES (?, ?)").with_parameter(1_i64))
            .unwrap_err();
        assert_eq!(
            err,
            AccessError::ParameterCountMismatch {
                required: 2,
                provided: 1
            }
        );
        assert!(conn.is_autocommit());
    }

    #[test]
    fn failing_single_write_is_rolled_back() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let err = coordinator
            .execute(&Task::new("INSERT INTO b (code) VALUES (?)").with_parameter("taken"))
            .unwrap_err();
        match err {
            AccessError::TransactionFailed {
                cause,
                index,
                rollback_error,
            } => {
                assert_eq!(index, Some(0));
                assert!(matches!(*cause, AccessError::StatementFailed { index: 0, .. }));
                assert_eq!(rollback_error, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(conn.is_autocommit());
    }

    #[test]
    fn batch_is_atomic_on_constraint_violation() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let err = coordinator
            .execute_batch(&[
                Task::new("INSERT INTO a (name) VALUES (?)").with_parameter("kept?"),
                Task::new("INSERT INTO b (code) VALUES (?)").with_parameter("taken"),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            AccessError::TransactionFailed { index: Some(1), .. }
        ));
        assert_eq!(count(&conn, "a"), 0);
        assert_eq!(count(&conn, "b"), 1);
        assert_eq!(coordinator.state(), TxState::Idle);
    }

    #[test]
    fn batch_fails_fast_on_parameter_mismatch() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let err = coordinator
            .execute_batch(&[
                Task::new("INSERT INTO a (name) VALUES (?)").with_parameter("first"),
                Task::new("INSERT INTO a (name) VALUES (?)").with_parameters(["x", "y"]),
                Task::new("INSERT INTO a (name) VALUES ('never')"),
            ])
            .unwrap_err();
        assert_eq!(
            err.root_cause(),
            &AccessError::ParameterCountMismatch {
                required: 1,
                provided: 2
            }
        );
        assert_eq!(count(&conn, "a"), 0);
    }

    #[test]
    fn batch_results_follow_task_order() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let results = coordinator
            .execute_batch(&[
                Task::new("CREATE TABLE c (v INTEGER)"),
                Task::new("INSERT INTO c VALUES (?), (?)").with_parameters([1_i64, 2]),
                Task::new("SELECT v FROM c ORDER BY v"),
            ])
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], ExecutionResult::AffectedCount(_)));
        assert_eq!(results[1], ExecutionResult::AffectedCount(2));
        assert_eq!(results[2].rows().map(<[_]>::len), Some(2));
    }

    #[test]
    fn begin_refuses_a_nested_transaction() {
        let conn = create_test_db();
        conn.execute_batch("BEGIN").unwrap();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let err = coordinator
            .execute_batch(&[Task::new("INSERT INTO a (name) VALUES ('x')")])
            .unwrap_err();
        assert!(matches!(err, AccessError::TransactionStartFailed(_)));
        conn.execute_batch("ROLLBACK").unwrap();
    }

    #[test]
    fn transaction_control_keywords_are_recognised() {
        for sql in [
            "BEGIN",
            "  commit",
            "End Transaction",
            "-- note\nROLLBACK",
            "/* x */ savepoint s1",
            "RELEASE s1;",
            "begin immediate",
        ] {
            assert!(is_transaction_control(sql), "{sql}");
        }
        for sql in [
            "SELECT 1",
            "INSERT INTO a (name) VALUES ('BEGIN')",
            "BEGINNING",
            "",
            "-- only a comment",
        ] {
            assert!(!is_transaction_control(sql), "{sql}");
        }
    }

    #[test]
    fn single_transaction_control_statement_is_rejected() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let err = coordinator.execute(&Task::new("BEGIN")).unwrap_err();
        assert!(matches!(err, AccessError::StatementFailed { index: 0, .. }));
        assert!(conn.is_autocommit());

        // The next write gets its own transaction as usual.
        coordinator
            .execute(&Task::new("INSERT INTO a (name) VALUES ('after')"))
            .unwrap();
        assert_eq!(count(&conn, "a"), 1);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn batch_cannot_commit_early() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        let err = coordinator
            .execute_batch(&[
                Task::new("INSERT INTO a (name) VALUES ('early')"),
                Task::new("COMMIT"),
                Task::new("INSERT INTO b (code) VALUES ('taken')"),
            ])
            .unwrap_err();
        match err {
            AccessError::TransactionFailed { cause, index, .. } => {
                assert_eq!(index, Some(1));
                assert!(matches!(*cause, AccessError::StatementFailed { index: 1, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(count(&conn, "a"), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn rollback_failure_is_attached_without_replacing_the_cause() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        coordinator.begin().unwrap();
        // Ends the transaction behind the coordinator's back.
        conn.execute_batch("COMMIT").unwrap();

        let cause = AccessError::StatementFailed {
            index: 0,
            message: "boom".to_string(),
        };
        match coordinator.abort(cause.clone(), Some(0)) {
            AccessError::TransactionFailed {
                cause: reported,
                index,
                rollback_error,
            } => {
                assert_eq!(*reported, cause);
                assert_eq!(index, Some(0));
                assert!(rollback_error.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(coordinator.state(), TxState::Idle);
    }

    #[test]
    fn empty_batch_touches_nothing() {
        let conn = create_test_db();
        let mut coordinator = TransactionCoordinator::new(&conn);
        assert_eq!(coordinator.execute_batch(&[]), Ok(Vec::new()));
        assert_eq!(coordinator.state(), TxState::Idle);
    }
}
