//! SQL track backend: one in-memory SQLite database per challenge.

use super::{Backend, BackendFactory, Interrupter};
use crate::lifecycle::{unescape_seed, CheckpointLog};
use mastery_common::protocol::{Checkpoint, SeedReport};
use mastery_common::types::{
    AssertionTest, CellValue, ExecutionResult, ResultSet, TestOutcome, TestRunReport, Track,
};
use rusqlite::config::DbConfig;
use rusqlite::limits::Limit;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection};
use std::time::Instant;
use tracing::{debug, info};

const LIST_TABLES: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";

pub struct SqliteBackend {
    conn: Option<Connection>,
    /// Unescaped seed of the current database, replayed on reset
    seed: Option<String>,
    /// Why the database is unusable, when seeding failed
    unavailable: Option<String>,
    interrupter: Interrupter,
    checkpoints: CheckpointLog,
}

impl SqliteBackend {
    pub fn new(interrupter: Interrupter) -> Self {
        Self {
            conn: None,
            seed: None,
            unavailable: None,
            interrupter,
            checkpoints: CheckpointLog::new(),
        }
    }

    pub fn checkpoints(&self) -> &CheckpointLog {
        &self.checkpoints
    }

    fn open(&mut self) -> Result<Connection, String> {
        self.checkpoints.record(Checkpoint::DbCreation);
        connect().map_err(|e| {
            let msg = format!("Failed to create database: {}", e);
            self.checkpoints.record_with(Checkpoint::Failed, Some(&msg));
            msg
        })
    }

    /// Point the interrupter at `conn` so a timeout stops whatever it is running
    fn arm_for(&self, conn: &Connection) {
        let handle = conn.get_interrupt_handle();
        self.interrupter.arm(move || handle.interrupt());
    }

    fn rearm(&self) {
        match self.conn.as_ref() {
            Some(conn) => self.arm_for(conn),
            None => self.interrupter.disarm(),
        }
    }

    fn unavailable_error(&self) -> String {
        match &self.unavailable {
            Some(reason) => format!("Database unavailable: {}", reason),
            None => "Database unavailable".to_string(),
        }
    }
}

impl Backend for SqliteBackend {
    fn track(&self) -> Track {
        Track::Sql
    }

    fn boot(&mut self) -> Result<(), String> {
        self.checkpoints.record(Checkpoint::ModuleLoading);
        info!(sqlite_version = rusqlite::version(), "SQL engine loaded");

        let conn = self.open()?;
        self.arm_for(&conn);
        self.conn = Some(conn);
        self.checkpoints.record(Checkpoint::Ready);
        Ok(())
    }

    fn execute(&mut self, source: &str) -> ExecutionResult {
        let start = Instant::now();
        let Some(conn) = self.conn.as_ref() else {
            return ExecutionResult::failure(self.unavailable_error(), 0);
        };

        let sql = source.trim();
        if sql.is_empty() {
            return ExecutionResult::rows(ResultSet::empty(), 0);
        }

        match run_statements(conn, sql) {
            Ok(result_set) => {
                debug!(rows = result_set.row_count, "Query executed");
                ExecutionResult::rows(result_set, elapsed_ms(start))
            }
            Err(e) => {
                let msg = e.to_string();
                self.checkpoints.record_with(Checkpoint::QueryFailed, Some(&msg));
                ExecutionResult::failure(msg, elapsed_ms(start))
            }
        }
    }

    /// Each assertion is a query; it passes when the first cell of its first row is truthy
    fn run_tests(&mut self, source: &str, tests: &[AssertionTest]) -> TestRunReport {
        let setup = self.execute(source);
        if !setup.success {
            return TestRunReport::setup_failed(setup.error.unwrap_or_default(), None);
        }
        let Some(conn) = self.conn.as_ref() else {
            return TestRunReport::setup_failed(self.unavailable_error(), None);
        };

        let results = tests
            .iter()
            .map(|test| match run_statements(conn, &test.code) {
                Ok(rs) => {
                    let truthy = rs
                        .rows
                        .first()
                        .and_then(|row| row.first())
                        .map(CellValue::is_truthy)
                        .unwrap_or(false);
                    if truthy {
                        TestOutcome::pass(&test.name, String::new())
                    } else {
                        TestOutcome::fail(
                            &test.name,
                            "Assertion query returned no truthy value",
                            String::new(),
                        )
                    }
                }
                Err(e) => TestOutcome::fail(&test.name, e.to_string(), String::new()),
            })
            .collect();

        TestRunReport::from_results(results)
    }

    /// Fresh database with the current seed replayed
    fn reset(&mut self) -> Result<(), String> {
        self.conn = None;
        self.interrupter.disarm();

        let conn = self.open()?;
        if let Some(seed) = self.seed.clone() {
            self.checkpoints.record(Checkpoint::SeedProcessing);
            self.checkpoints.record(Checkpoint::DbSeeding);
            self.arm_for(&conn);
            if let Err(e) = conn.execute_batch(&seed) {
                let msg = format!("Seed data failed to load: {}", e);
                self.checkpoints.record_with(Checkpoint::Failed, Some(&msg));
                self.unavailable = Some(msg.clone());
                self.interrupter.disarm();
                return Err(msg);
            }
        }

        self.conn = Some(conn);
        self.unavailable = None;
        self.rearm();
        self.checkpoints.record(Checkpoint::Ready);
        Ok(())
    }

    fn load_seed(&mut self, raw: &str) -> Result<SeedReport, String> {
        // The old database is gone as soon as a new challenge asks for one
        self.conn = None;
        self.seed = None;
        self.interrupter.disarm();

        let conn = self.open()?;

        self.checkpoints.record(Checkpoint::SeedProcessing);
        let seed = unescape_seed(raw);

        self.checkpoints.record(Checkpoint::DbSeeding);
        self.arm_for(&conn);
        if let Err(e) = conn.execute_batch(&seed) {
            let msg = format!("Seed data failed to load: {}", e);
            self.checkpoints.record_with(Checkpoint::Failed, Some(&msg));
            self.unavailable = Some(msg.clone());
            self.interrupter.disarm();
            return Err(msg);
        }

        let tables = list_tables(&conn).map_err(|e| e.to_string())?;
        info!(tables = ?tables, "Seed data loaded");

        self.conn = Some(conn);
        self.seed = Some(seed);
        self.unavailable = None;
        self.checkpoints.record(Checkpoint::Ready);

        Ok(SeedReport {
            checkpoint: Checkpoint::Ready,
            tables,
        })
    }

    /// Runs on a throwaway database so the learner's database is never touched
    fn execute_reference(&mut self, setup: &str, source: &str) -> ExecutionResult {
        let start = Instant::now();
        let scratch = match connect() {
            Ok(conn) => conn,
            Err(e) => return ExecutionResult::failure(e.to_string(), 0),
        };
        self.arm_for(&scratch);

        let result = match scratch.execute_batch(&unescape_seed(setup)) {
            Err(e) => ExecutionResult::failure(
                format!("Reference setup failed: {}", e),
                elapsed_ms(start),
            ),
            Ok(()) => match run_statements(&scratch, source.trim()) {
                Ok(rs) => ExecutionResult::rows(rs, elapsed_ms(start)),
                Err(e) => ExecutionResult::failure(e.to_string(), elapsed_ms(start)),
            },
        };

        self.rearm();
        result
    }
}

/// In-memory database that cannot reach the filesystem: no ATTACH (which also
/// rules out VACUUM INTO) and no writes to the schema or file internals.
fn connect() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    let _ = conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0);
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DEFENSIVE, true)?;
    Ok(conn)
}

/// Run every statement of `sql` in order, returning the shape of the last one.
///
/// A last statement that yields no rows (DDL, DML, empty SELECT) gives an empty shape.
fn run_statements(conn: &Connection, sql: &str) -> rusqlite::Result<ResultSet> {
    let mut batch = Batch::new(conn, sql);
    let mut last = ResultSet::empty();

    while let Some(mut stmt) = batch.next()? {
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        if columns.is_empty() {
            stmt.execute([])?;
            last = ResultSet::empty();
            continue;
        }

        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(cell_from(row.get_ref(idx)?));
            }
            rows.push(cells);
        }

        last = if rows.is_empty() {
            ResultSet::empty()
        } else {
            ResultSet::new(columns, rows)
        };
    }

    Ok(last)
}

fn cell_from(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Integer(i),
        ValueRef::Real(r) => CellValue::Real(r),
        ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => CellValue::Blob(b.to_vec()),
    }
}

fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(LIST_TABLES)?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names.collect()
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteBackendFactory;

impl BackendFactory for SqliteBackendFactory {
    fn track(&self) -> Track {
        Track::Sql
    }

    fn create(&self, interrupter: Interrupter) -> Box<dyn Backend> {
        Box::new(SqliteBackend::new(interrupter))
    }
}
