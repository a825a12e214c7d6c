//! libSQL schema. Idempotent; executed on every startup.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS site_trust (
    origin TEXT PRIMARY KEY,
    account_address TEXT NOT NULL,
    connected_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_site_trust_connected ON site_trust(connected_at);

CREATE TABLE IF NOT EXISTS pending_requests (
    kind TEXT PRIMARY KEY,
    request_id TEXT NOT NULL UNIQUE,
    origin TEXT NOT NULL,
    requester_tab_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    outcome TEXT,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS approval_windows (
    kind TEXT PRIMARY KEY,
    window_id TEXT NOT NULL UNIQUE,
    request_id TEXT NOT NULL,
    opened_for_tab_id INTEGER NOT NULL,
    opened_at TEXT NOT NULL
);
"#;
