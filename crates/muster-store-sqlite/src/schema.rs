//! SQL schema for the Muster SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS applications (
    application_id INTEGER PRIMARY KEY AUTOINCREMENT,
    author_id      INTEGER NOT NULL,
    character_id   INTEGER,
    kind           TEXT    NOT NULL,   -- ApplicationType, snake_case
    status         TEXT    NOT NULL,   -- ApplicationStatus, snake_case
    data_json      TEXT    NOT NULL,
    reviewer_id    INTEGER,
    review_comment TEXT,
    created_at     TEXT    NOT NULL,   -- RFC 3339 UTC, microseconds
    updated_at     TEXT    NOT NULL
);

-- Append-only. The first row of an application is its submission.
CREATE TABLE IF NOT EXISTS application_history (
    entry_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    application_id INTEGER NOT NULL REFERENCES applications(application_id),
    status         TEXT    NOT NULL,
    at             TEXT    NOT NULL,
    comment        TEXT,
    reviewer_id    INTEGER
);

CREATE TABLE IF NOT EXISTS tests (
    test_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title            TEXT    NOT NULL,
    related_json     TEXT    NOT NULL,
    duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0),
    questions_json   TEXT    NOT NULL,
    created_at       TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS test_sessions (
    session_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL,
    test_id        INTEGER NOT NULL REFERENCES tests(test_id),
    application_id INTEGER REFERENCES applications(application_id),
    start_time     TEXT    NOT NULL,
    end_time       TEXT,
    status         TEXT    NOT NULL    -- 'in_progress' | 'completed' | 'abandoned'
);

-- At most one live attempt per member and test.
CREATE UNIQUE INDEX IF NOT EXISTS test_sessions_live_idx
    ON test_sessions(user_id, test_id) WHERE status = 'in_progress';

-- Written together with the completion of its session; never updated.
CREATE TABLE IF NOT EXISTS test_results (
    result_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id          INTEGER NOT NULL,
    test_id          INTEGER NOT NULL REFERENCES tests(test_id),
    session_id       INTEGER NOT NULL UNIQUE REFERENCES test_sessions(session_id),
    application_id   INTEGER,
    score            INTEGER NOT NULL,
    max_score        INTEGER NOT NULL,
    percentage       REAL    NOT NULL,
    passed           INTEGER NOT NULL,
    time_spent       INTEGER NOT NULL,
    focus_lost_count INTEGER NOT NULL,
    warnings_count   INTEGER NOT NULL,
    answers_json     TEXT    NOT NULL,
    results_json     TEXT    NOT NULL,
    created_at       TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS members (
    user_id     INTEGER PRIMARY KEY,
    is_reviewer INTEGER NOT NULL DEFAULT 0,
    added_at    TEXT    NOT NULL
);

-- Outbox drained by a delivery worker.
CREATE TABLE IF NOT EXISTS notifications (
    notification_id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_id    INTEGER NOT NULL,
    content         TEXT    NOT NULL,
    link            TEXT    NOT NULL,
    created_at      TEXT    NOT NULL,
    delivered_at    TEXT
);

CREATE INDEX IF NOT EXISTS applications_author_idx ON applications(author_id);
CREATE INDEX IF NOT EXISTS history_application_idx ON application_history(application_id);
CREATE INDEX IF NOT EXISTS results_user_test_idx   ON test_results(user_id, test_id);
CREATE INDEX IF NOT EXISTS notifications_open_idx  ON notifications(delivered_at);

PRAGMA user_version = 1;
";
