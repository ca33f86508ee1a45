/// End-to-end tests for sandbox sessions
///
/// These tests drive a full session (bridge → host thread → backend → grader):
/// 1. SQL challenges grade on shape and against the reference solution
/// 2. Databases are isolated per challenge and per session
/// 3. Calls before initialization fail softly
/// 4. Timeouts replace the worker and the session recovers
/// 5. Python submissions report per-test results (skipped without python3)

#[cfg(test)]
mod session_tests {
    use crate::backend::python::python_available;
    use crate::backend::stub::StubFactory;
    use crate::backend::SqliteBackendFactory;
    use crate::config::{TimeoutPolicy, TrackConfig, TrackConfigManager};
    use crate::error::SandboxError;
    use crate::session::SandboxSession;
    use mastery_common::protocol::{Checkpoint, HostState};
    use mastery_common::types::{
        AssertionTest, Challenge, ChallengeKind, Difficulty, QueryTest, Track, NOT_INITIALIZED,
    };
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn sql_session(timeout_ms: u64) -> SandboxSession {
        let mut config = TrackConfig::builtin(Track::Sql);
        config.call_timeout_ms = timeout_ms;
        SandboxSession::new(Arc::new(SqliteBackendFactory), config)
    }

    fn python_session() -> SandboxSession {
        SandboxSession::for_track(Track::Python, &TrackConfigManager::builtin())
            .expect("python track is built in")
    }

    fn challenge(id: &str, solution: &str, kind: ChallengeKind) -> Challenge {
        Challenge {
            id: id.to_string(),
            title: id.to_string(),
            module: "week-01".to_string(),
            day: 1,
            order: 1,
            description: String::new(),
            starter_code: String::new(),
            solution: solution.to_string(),
            hints: vec![],
            difficulty: Difficulty::Beginner,
            kind,
        }
    }

    fn select_id_challenge() -> Challenge {
        challenge(
            "sql-select-id",
            "SELECT id FROM t",
            ChallengeKind::Sql {
                seed_data: "CREATE TABLE t(id INT); INSERT INTO t VALUES (1);".to_string(),
                tests: vec![QueryTest {
                    expected_columns: Some(vec!["id".to_string()]),
                    expected_row_count: Some(1),
                    ..Default::default()
                }],
            },
        )
    }

    /// Test: Matching shape and rows pass
    #[tokio::test]
    async fn test_sql_submission_passes() {
        let session = sql_session(5_000);
        let submission = session
            .submit(&select_id_challenge(), "SELECT id FROM t")
            .await
            .expect("submit should work");

        assert!(submission.execution.success);
        let rows = submission.execution.result_set.as_ref().unwrap();
        assert_eq!(rows.columns, vec!["id"]);
        assert_eq!(rows.row_count, 1);
        assert!(submission.verdict.passed, "hints: {:?}", submission.verdict.hints);
        assert_eq!(submission.verdict.score, 100);
    }

    /// Test: An extra column fails with a column-count hint
    #[tokio::test]
    async fn test_sql_extra_column_fails() {
        let session = sql_session(5_000);
        let submission = session
            .submit(&select_id_challenge(), "SELECT id, 1 as extra FROM t")
            .await
            .unwrap();

        assert!(!submission.verdict.passed);
        assert!(submission
            .verdict
            .hints
            .contains(&"Expected 1 column(s), got 2".to_string()));
    }

    /// Test: Destructive submissions do not leak into the next attempt
    #[tokio::test]
    async fn test_sql_each_submission_starts_clean() {
        let session = sql_session(5_000);
        let challenge = select_id_challenge();

        let first = session
            .submit(&challenge, "DELETE FROM t; SELECT id FROM t")
            .await
            .unwrap();
        assert!(!first.verdict.passed);

        let second = session.submit(&challenge, "SELECT id FROM t").await.unwrap();
        assert!(second.verdict.passed, "hints: {:?}", second.verdict.hints);
    }

    /// Test: A broken query scores zero and surfaces the database error
    #[tokio::test]
    async fn test_sql_failing_query() {
        let session = sql_session(5_000);
        let submission = session
            .submit(&select_id_challenge(), "SELECT id FROM missing")
            .await
            .unwrap();

        assert!(!submission.execution.success);
        assert_eq!(submission.verdict.score, 0);
        assert!(submission.verdict.hints[0].contains("no such table"));
    }

    /// Test: Re-seeding leaves only the new seed's tables
    #[tokio::test]
    async fn test_reseed_isolates_tables() {
        let session = sql_session(5_000);
        let first = session
            .initialize_database("CREATE TABLE customers(id INT);")
            .await
            .unwrap();
        assert_eq!(first.tables, vec!["customers"]);

        let second = session
            .initialize_database("CREATE TABLE orders(id INT);\\nCREATE TABLE items(id INT);")
            .await
            .unwrap();
        assert_eq!(second.checkpoint, Checkpoint::Ready);
        assert_eq!(second.tables, vec!["items", "orders"]);

        let old = session.execute("SELECT * FROM customers").await.unwrap();
        assert!(!old.success, "old table must be gone");
    }

    /// Test: Same seed is not reloaded, a different challenge seed is
    #[tokio::test]
    async fn test_prepare_reseeds_only_on_change() {
        let session = sql_session(5_000);
        let challenge = select_id_challenge();

        let first = session.prepare(&challenge).await.unwrap();
        assert!(first.fresh);
        assert_eq!(first.seed.unwrap().tables, vec!["t"]);

        session.execute("INSERT INTO t VALUES (2)").await.unwrap();
        let again = session.prepare(&challenge).await.unwrap();
        assert!(!again.fresh);

        let rows = session.execute("SELECT COUNT(*) FROM t").await.unwrap();
        assert_eq!(rows.result_set.unwrap().rows[0][0].to_string(), "2");
    }

    /// Test: A broken seed blocks queries until a good seed loads
    #[tokio::test]
    async fn test_seed_failure_is_blocking() {
        let session = sql_session(5_000);
        let err = session
            .initialize_database("CREATE TABLE (")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Host(_)));

        let blocked = session.execute("SELECT 1").await.unwrap();
        assert!(blocked.error.unwrap().starts_with("Database unavailable"));

        session.initialize_database("CREATE TABLE ok(id INT);").await.unwrap();
        assert!(session.execute("SELECT 1").await.unwrap().success);
    }

    /// Test: Execute before initialize is a soft failure, not an error
    #[tokio::test]
    async fn test_execute_before_initialize() {
        let session = sql_session(5_000);
        let result = session.execute("SELECT 1").await.expect("no error expected");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(NOT_INITIALIZED));

        assert_eq!(session.initialize().await.unwrap(), HostState::Ready);
        assert!(session.execute("SELECT 1").await.unwrap().success);
    }

    /// Test: Grading a challenge from the other track is refused
    #[tokio::test]
    async fn test_track_mismatch() {
        let session = sql_session(5_000);
        let python = challenge(
            "py",
            "x = 1",
            ChallengeKind::Python {
                tests: vec![AssertionTest::new("t", "assert x == 1")],
            },
        );
        let err = session.submit(&python, "x = 1").await.unwrap_err();
        assert_eq!(
            err,
            SandboxError::TrackMismatch {
                session: Track::Sql,
                challenge: Track::Python
            }
        );
    }

    /// Test: Sessions never see each other's databases
    #[tokio::test]
    async fn test_parallel_sessions_are_isolated() {
        let a = sql_session(5_000);
        let b = sql_session(5_000);

        let (ra, rb) = tokio::join!(
            a.initialize_database("CREATE TABLE only_a(id INT);"),
            b.initialize_database("CREATE TABLE only_b(id INT);")
        );
        assert_eq!(ra.unwrap().tables, vec!["only_a"]);
        assert_eq!(rb.unwrap().tables, vec!["only_b"]);

        assert!(!a.execute("SELECT * FROM only_b").await.unwrap().success);
        assert!(!b.execute("SELECT * FROM only_a").await.unwrap().success);
    }

    /// Test: A runaway query times out and the session recovers on a new worker
    #[tokio::test]
    async fn test_sql_timeout_respawns() {
        let session = sql_session(300);
        let challenge = select_id_challenge();
        session.prepare(&challenge).await.unwrap();
        let before = session.generation();

        let err = session
            .execute("WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { method: "execute", .. }));
        assert_eq!(session.generation(), before + 1);

        // the new worker is booted transparently, the challenge needs seeding again
        assert!(session.execute("SELECT 1").await.unwrap().success);
        let again = session.prepare(&challenge).await.unwrap();
        assert!(again.fresh, "database must be reseeded after a respawn");
    }

    /// Test: Respawn boots the replacement worker exactly once
    #[tokio::test]
    async fn test_stub_timeout_reinitializes() {
        let (factory, control) = StubFactory::new();
        let mut config = TrackConfig::builtin(Track::Python);
        config.call_timeout_ms = 100;
        config.on_timeout = TimeoutPolicy::Respawn;
        let session = SandboxSession::new(factory, config);

        session.initialize().await.unwrap();
        let err = session.execute("sleep:5000").await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));

        let result = session.execute("hello").await.unwrap();
        assert_eq!(result.stdout, "hello");
        assert_eq!(control.boots.load(Ordering::SeqCst), 2);
        assert_eq!(control.created.load(Ordering::SeqCst), 2);
    }

    /// Test: A failed boot surfaces as an initialization error and can be retried
    #[tokio::test]
    async fn test_boot_failure_then_retry() {
        let (factory, control) = StubFactory::new();
        control.fail_boot.store(true, Ordering::SeqCst);
        let session = SandboxSession::new(factory, TrackConfig::builtin(Track::Python));

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, SandboxError::Initialization(_)));
        assert_eq!(session.status().await.unwrap(), HostState::Error);

        control.fail_boot.store(false, Ordering::SeqCst);
        assert_eq!(session.initialize().await.unwrap(), HostState::Ready);
    }

    fn python_challenge() -> Challenge {
        challenge(
            "py-answer",
            "result = 42",
            ChallengeKind::Python {
                tests: vec![AssertionTest::new("test_result", "assert result == 42")],
            },
        )
    }

    /// Test: A wrong value fails its assertion with a readable hint
    #[tokio::test]
    async fn test_python_assertion_failure() {
        if !python_available() {
            return;
        }
        let session = python_session();
        let submission = session.submit(&python_challenge(), "result = 41").await.unwrap();

        assert!(submission.execution.success);
        assert!(!submission.verdict.passed);
        assert!(submission.verdict.feedback.starts_with("0/1 tests passed"));
        assert!(submission.verdict.hints[0].starts_with("Assertion failed"));
    }

    /// Test: Invalid syntax short-circuits grading with the error surfaced
    #[tokio::test]
    async fn test_python_syntax_error() {
        if !python_available() {
            return;
        }
        let session = python_session();
        let submission = session
            .submit(&python_challenge(), "result = (42")
            .await
            .unwrap();

        assert!(!submission.execution.success);
        assert!(submission.execution.error.as_deref().unwrap().starts_with("SyntaxError"));
        assert!(!submission.verdict.passed);
        assert!(submission.verdict.feedback.contains("SyntaxError"));
    }

    /// Test: A correct submission passes, and a stale namespace cannot help a later one
    #[tokio::test]
    async fn test_python_pass_then_clean_namespace() {
        if !python_available() {
            return;
        }
        let session = python_session();
        let good = session.submit(&python_challenge(), "result = 6 * 7\nprint(result)").await.unwrap();
        assert!(good.verdict.passed);
        assert_eq!(good.execution.stdout, "42\n");

        let empty = session.submit(&python_challenge(), "pass").await.unwrap();
        assert!(!empty.verdict.passed, "result from the previous submission must be gone");
    }

    /// Test: Submissions cannot rewrite the test runner, now or for later submissions
    #[tokio::test]
    async fn test_python_cannot_tamper_with_grading() {
        if !python_available() {
            return;
        }
        let session = python_session();
        let tampering = "import __main__, builtins\n\
                         __main__._run = lambda code: ('', '', None, None)\n\
                         builtins.compile = lambda *a, **k: None\n\
                         builtins.BaseException = type('Never', (Exception,), {})";
        let forged = session.submit(&python_challenge(), tampering).await.unwrap();
        assert!(!forged.verdict.passed);
        assert_eq!(forged.verdict.score, 0);

        let next = session.submit(&python_challenge(), "pass").await.unwrap();
        assert!(!next.verdict.passed);
        assert!(next.verdict.tests[0].error.as_deref().unwrap().starts_with("NameError"));
    }

    /// Test: One failing test does not stop the next from running
    #[tokio::test]
    async fn test_python_tests_are_isolated() {
        if !python_available() {
            return;
        }
        let session = python_session();
        session.initialize().await.unwrap();
        let tests = vec![
            AssertionTest::new("boom", "raise ValueError('nope')"),
            AssertionTest::new("after", "assert double(2) == 4"),
        ];
        let verdict = session
            .grade_submission("def double(x):\n    return x * 2", &tests)
            .await
            .unwrap();

        assert_eq!(verdict.tests.len(), 2);
        assert!(!verdict.tests[0].passed);
        assert!(verdict.tests[1].passed);
        assert_eq!(verdict.score, 50);
    }

    /// Test: Reset twice is the same as reset once
    #[tokio::test]
    async fn test_python_reset_is_idempotent() {
        if !python_available() {
            return;
        }
        let session = python_session();
        session.initialize().await.unwrap();
        session.execute("counter = 1").await.unwrap();

        session.reset().await.unwrap();
        session.reset().await.unwrap();

        let result = session.execute("print(counter)").await.unwrap();
        assert!(result.error.unwrap().starts_with("NameError"));
        assert!(session.execute("print('fine')").await.unwrap().success);
    }
}
