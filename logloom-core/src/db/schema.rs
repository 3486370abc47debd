//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Tenancy
    -- ============================================

    CREATE TABLE organizations (
        id               TEXT PRIMARY KEY,
        name             TEXT NOT NULL,
        created_at       DATETIME NOT NULL,
        settings         JSON
    );

    CREATE TABLE workspaces (
        id               TEXT PRIMARY KEY,
        organization_id  TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
        name             TEXT NOT NULL,
        created_at       DATETIME NOT NULL,
        settings         JSON
    );

    CREATE INDEX idx_workspaces_org ON workspaces(organization_id);

    CREATE TABLE projects (
        id               TEXT PRIMARY KEY,
        workspace_id     TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        name             TEXT NOT NULL,
        directory_path   TEXT NOT NULL,
        created_at       DATETIME NOT NULL,
        last_activity_at DATETIME,

        UNIQUE(workspace_id, directory_path)
    );

    CREATE TABLE developers (
        id               TEXT PRIMARY KEY,
        workspace_id     TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        username         TEXT NOT NULL,
        created_at       DATETIME NOT NULL,

        UNIQUE(workspace_id, username)
    );

    -- ============================================
    -- Collectors (before conversations: FK target)
    -- ============================================

    CREATE TABLE collectors (
        id               TEXT PRIMARY KEY,
        workspace_id     TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        name             TEXT NOT NULL,
        collector_type   TEXT NOT NULL,
        api_key_hash     TEXT NOT NULL,
        api_key_prefix   TEXT NOT NULL,
        is_active        INTEGER NOT NULL DEFAULT 1,
        extra_data       JSON,
        created_at       DATETIME NOT NULL
    );

    -- ============================================
    -- Conversations (the aggregate root)
    -- ============================================

    CREATE TABLE conversations (
        id                     TEXT PRIMARY KEY,
        workspace_id           TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        project_id             TEXT REFERENCES projects(id) ON DELETE SET NULL,
        developer_id           TEXT REFERENCES developers(id) ON DELETE SET NULL,
        agent_type             TEXT NOT NULL,
        agent_version          TEXT,
        start_time             DATETIME NOT NULL,
        end_time               DATETIME,
        status                 TEXT NOT NULL,       -- 'open', 'completed', 'abandoned'
        success                INTEGER,             -- tri-state: 1, 0, NULL
        conversation_type      TEXT NOT NULL,       -- 'main', 'agent', 'metadata'
        parent_conversation_id TEXT REFERENCES conversations(id) ON DELETE SET NULL,
        collector_session_id   TEXT UNIQUE,
        collector_id           TEXT REFERENCES collectors(id) ON DELETE SET NULL,
        last_event_sequence    INTEGER NOT NULL DEFAULT 0,

        -- Denormalized counts
        message_count          INTEGER NOT NULL DEFAULT 0,
        epoch_count            INTEGER NOT NULL DEFAULT 0,
        files_count            INTEGER NOT NULL DEFAULT 0,

        agent_metadata         JSON,
        extra_data             JSON,
        tags                   JSON,
        plans                  JSON
    );

    CREATE INDEX idx_conversations_workspace ON conversations(workspace_id);
    CREATE INDEX idx_conversations_project ON conversations(project_id);
    CREATE INDEX idx_conversations_parent ON conversations(parent_conversation_id);
    CREATE INDEX idx_conversations_type ON conversations(workspace_id, conversation_type);
    CREATE INDEX idx_conversations_start ON conversations(start_time DESC);

    CREATE TABLE epochs (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sequence         INTEGER NOT NULL,
        classification   TEXT,
        start_time       DATETIME NOT NULL,
        end_time         DATETIME,
        extra_data       JSON,

        UNIQUE(conversation_id, sequence)
    );

    CREATE TABLE messages (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        epoch_id         TEXT NOT NULL REFERENCES epochs(id) ON DELETE CASCADE,
        sequence         INTEGER NOT NULL,
        role             TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system', 'tool')),
        content          TEXT NOT NULL,
        timestamp        DATETIME,
        model            TEXT,
        tool_calls       JSON,
        tool_results     JSON,
        code_changes     JSON,
        thinking_content TEXT,
        tokens_in        INTEGER,
        tokens_out       INTEGER,
        raw_data         JSON,

        UNIQUE(conversation_id, sequence)
    );

    CREATE INDEX idx_messages_conversation ON messages(conversation_id, sequence);
    CREATE INDEX idx_messages_epoch ON messages(epoch_id);

    CREATE TABLE files_touched (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        file_path        TEXT NOT NULL,
        change_type      TEXT NOT NULL,

        UNIQUE(conversation_id, file_path, change_type)
    );

    -- ============================================
    -- Ingestion state
    -- ============================================

    CREATE TABLE raw_logs (
        id                    TEXT PRIMARY KEY,
        workspace_id          TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        conversation_id       TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        file_path             TEXT NOT NULL,
        file_hash             TEXT NOT NULL,
        last_processed_offset INTEGER NOT NULL DEFAULT 0,
        last_processed_line   INTEGER NOT NULL DEFAULT 0,
        file_size_bytes       INTEGER NOT NULL DEFAULT 0,
        partial_hash          TEXT,
        agent_type            TEXT,
        ingested_at           DATETIME NOT NULL,

        -- Content-level dedup is a tenancy-local concern
        UNIQUE(workspace_id, file_hash)
    );

    CREATE INDEX idx_raw_logs_path ON raw_logs(workspace_id, file_path);

    -- Audit trail; conversation reference intentionally not a FK so
    -- job history survives conversation deletion.
    CREATE TABLE ingestion_jobs (
        id               TEXT PRIMARY KEY,
        workspace_id     TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        status           TEXT NOT NULL,       -- 'pending', 'success', 'duplicate', 'skipped', 'failed'
        source_type      TEXT NOT NULL,       -- 'watch', 'cli', 'upload', 'collector'
        source_config_id TEXT,
        file_path        TEXT,
        created_by       TEXT,
        conversation_id  TEXT,
        raw_log_id       TEXT,
        incremental      INTEGER NOT NULL DEFAULT 0,
        messages_added   INTEGER NOT NULL DEFAULT 0,
        stage_metrics    JSON,
        error_kind       TEXT,
        error_message    TEXT,
        started_at       DATETIME NOT NULL,
        finished_at      DATETIME
    );

    CREATE INDEX idx_jobs_workspace ON ingestion_jobs(workspace_id, started_at DESC);
    CREATE INDEX idx_jobs_status ON ingestion_jobs(status) WHERE status != 'success';

    -- ============================================
    -- Collector protocol state
    -- ============================================

    -- Dedup ledger for applied events
    CREATE TABLE collector_events (
        conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        event_hash       TEXT NOT NULL,
        sequence         INTEGER NOT NULL,
        received_at      DATETIME NOT NULL,

        PRIMARY KEY (conversation_id, event_hash)
    );

    -- ============================================
    -- Canonical cache & analytics
    -- ============================================

    CREATE TABLE canonical_cache (
        id                    TEXT PRIMARY KEY,
        conversation_id       TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        canonical_type        TEXT NOT NULL,
        version               INTEGER NOT NULL,
        narrative             TEXT NOT NULL,
        token_count           INTEGER NOT NULL,
        source_message_count  INTEGER NOT NULL,
        source_token_estimate INTEGER NOT NULL,
        generated_at          DATETIME NOT NULL,
        expires_at            DATETIME,

        UNIQUE(conversation_id, canonical_type)
    );

    CREATE TABLE recommendations (
        id               TEXT PRIMARY KEY,
        workspace_id     TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        kind             TEXT NOT NULL,
        title            TEXT NOT NULL,
        body             TEXT NOT NULL,
        confidence       REAL NOT NULL,
        status           TEXT NOT NULL DEFAULT 'open',   -- 'open', 'accepted', 'dismissed'
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX idx_recommendations_workspace ON recommendations(workspace_id, created_at DESC);

    -- ============================================
    -- Watch & workers
    -- ============================================

    CREATE TABLE watch_configs (
        id                 TEXT PRIMARY KEY,
        workspace_id       TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        directory          TEXT NOT NULL,
        project_name       TEXT,
        developer_username TEXT,
        is_active          INTEGER NOT NULL DEFAULT 0,
        created_at         DATETIME NOT NULL
    );

    CREATE TABLE worker_jobs (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL,
        kind             TEXT NOT NULL,       -- 'tagging', 'slash_command', 'mcp_detection'
        status           TEXT NOT NULL DEFAULT 'pending',
        attempts         INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT,
        created_at       DATETIME NOT NULL,
        claimed_at       DATETIME,
        finished_at      DATETIME
    );

    CREATE INDEX idx_worker_jobs_pending ON worker_jobs(kind, created_at) WHERE status = 'pending';
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "organizations",
            "workspaces",
            "projects",
            "developers",
            "collectors",
            "conversations",
            "epochs",
            "messages",
            "files_touched",
            "raw_logs",
            "ingestion_jobs",
            "collector_events",
            "canonical_cache",
            "recommendations",
            "watch_configs",
            "worker_jobs",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_message_sequence_unique() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        run_migrations(&conn).unwrap();

        conn.execute_batch(
            r#"
            INSERT INTO organizations (id, name, created_at) VALUES ('o1', 'org', '2025-01-01T00:00:00Z');
            INSERT INTO workspaces (id, organization_id, name, created_at) VALUES ('w1', 'o1', 'ws', '2025-01-01T00:00:00Z');
            INSERT INTO conversations (id, workspace_id, agent_type, start_time, status, conversation_type)
                VALUES ('c1', 'w1', 'claude-code', '2025-01-01T00:00:00Z', 'open', 'main');
            INSERT INTO epochs (id, conversation_id, sequence, start_time)
                VALUES ('e1', 'c1', 1, '2025-01-01T00:00:00Z');
            INSERT INTO messages (id, conversation_id, epoch_id, sequence, role, content)
                VALUES ('m1', 'c1', 'e1', 1, 'user', 'hi');
            "#,
        )
        .unwrap();

        // Same (conversation_id, sequence) must be rejected
        let dup = conn.execute(
            "INSERT INTO messages (id, conversation_id, epoch_id, sequence, role, content)
             VALUES ('m2', 'c1', 'e1', 1, 'user', 'again')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_cascade_delete_conversation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        run_migrations(&conn).unwrap();

        conn.execute_batch(
            r#"
            INSERT INTO organizations (id, name, created_at) VALUES ('o1', 'org', '2025-01-01T00:00:00Z');
            INSERT INTO workspaces (id, organization_id, name, created_at) VALUES ('w1', 'o1', 'ws', '2025-01-01T00:00:00Z');
            INSERT INTO conversations (id, workspace_id, agent_type, start_time, status, conversation_type)
                VALUES ('c1', 'w1', 'claude-code', '2025-01-01T00:00:00Z', 'open', 'main');
            INSERT INTO epochs (id, conversation_id, sequence, start_time)
                VALUES ('e1', 'c1', 1, '2025-01-01T00:00:00Z');
            INSERT INTO messages (id, conversation_id, epoch_id, sequence, role, content)
                VALUES ('m1', 'c1', 'e1', 1, 'user', 'hi');
            INSERT INTO canonical_cache (id, conversation_id, canonical_type, version, narrative,
                token_count, source_message_count, source_token_estimate, generated_at)
                VALUES ('cc1', 'c1', 'tagging', 1, 'n', 10, 1, 100, '2025-01-01T00:00:00Z');
            "#,
        )
        .unwrap();

        conn.execute("DELETE FROM conversations WHERE id = 'c1'", [])
            .unwrap();

        for table in ["epochs", "messages", "canonical_cache"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{} rows should cascade", table);
        }
    }

    #[test]
    fn test_cascade_delete_organization() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        run_migrations(&conn).unwrap();

        conn.execute_batch(
            r#"
            INSERT INTO organizations (id, name, created_at) VALUES ('o1', 'org', '2025-01-01T00:00:00Z');
            INSERT INTO workspaces (id, organization_id, name, created_at) VALUES ('w1', 'o1', 'ws', '2025-01-01T00:00:00Z');
            INSERT INTO conversations (id, workspace_id, agent_type, start_time, status, conversation_type)
                VALUES ('c1', 'w1', 'claude-code', '2025-01-01T00:00:00Z', 'open', 'main');
            "#,
        )
        .unwrap();

        conn.execute("DELETE FROM organizations WHERE id = 'o1'", [])
            .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
