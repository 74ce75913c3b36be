//! Schema migration for the PostgreSQL store.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// Creates the three rebuild tables. Safe to run repeatedly.
pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- Rebuild engine tables
-- ================================================================

CREATE TABLE IF NOT EXISTS rebuild_events (
    id              BIGSERIAL PRIMARY KEY,
    message_id      VARCHAR(255) NOT NULL,
    event_type      VARCHAR(64) NOT NULL,
    search_key      VARCHAR(255) NOT NULL,
    state           VARCHAR(32) NOT NULL DEFAULT 'initialized',
    state_reason    TEXT NOT NULL DEFAULT '',
    dry_run         BOOLEAN NOT NULL DEFAULT FALSE,
    requester       VARCHAR(255),
    handler_results JSONB NOT NULL DEFAULT '[]'::jsonb,
    time_created    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    time_done       TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_rebuild_events_message ON rebuild_events (message_id);
CREATE INDEX IF NOT EXISTS idx_rebuild_events_search_key ON rebuild_events (search_key);
CREATE INDEX IF NOT EXISTS idx_rebuild_events_state ON rebuild_events (state);

CREATE TABLE IF NOT EXISTS rebuild_artifact_builds (
    id              BIGSERIAL PRIMARY KEY,
    event_id        BIGINT NOT NULL REFERENCES rebuild_events(id) ON DELETE CASCADE,
    name            VARCHAR(255) NOT NULL,
    artifact_type   VARCHAR(32) NOT NULL,
    original_nvr    VARCHAR(512) NOT NULL,
    rebuilt_nvr     VARCHAR(512),
    state           VARCHAR(32) NOT NULL DEFAULT 'planned',
    state_reason    TEXT NOT NULL DEFAULT '',
    rebuild_reason  VARCHAR(32) NOT NULL,
    dep_on_id       BIGINT REFERENCES rebuild_artifact_builds(id),
    build_args      JSONB NOT NULL DEFAULT 'null'::jsonb,
    task_id         VARCHAR(255),
    retry_count     INTEGER NOT NULL DEFAULT 0,
    time_created    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    time_submitted  TIMESTAMPTZ,
    time_completed  TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_rebuild_builds_event ON rebuild_artifact_builds (event_id);
CREATE INDEX IF NOT EXISTS idx_rebuild_builds_dep_on ON rebuild_artifact_builds (dep_on_id);
CREATE INDEX IF NOT EXISTS idx_rebuild_builds_type_task ON rebuild_artifact_builds (artifact_type, task_id);
CREATE INDEX IF NOT EXISTS idx_rebuild_builds_original_nvr ON rebuild_artifact_builds (original_nvr);
CREATE INDEX IF NOT EXISTS idx_rebuild_builds_rebuilt_nvr ON rebuild_artifact_builds (rebuilt_nvr);
CREATE INDEX IF NOT EXISTS idx_rebuild_builds_state ON rebuild_artifact_builds (state);

CREATE TABLE IF NOT EXISTS rebuild_event_dependencies (
    event_id        BIGINT NOT NULL REFERENCES rebuild_events(id) ON DELETE CASCADE,
    depends_on_id   BIGINT NOT NULL REFERENCES rebuild_events(id) ON DELETE CASCADE,
    PRIMARY KEY (event_id, depends_on_id)
);

CREATE INDEX IF NOT EXISTS idx_rebuild_event_deps_target ON rebuild_event_dependencies (depends_on_id);
"#;

/// Run the rebuild schema migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("rebuild migration failed: {e}"))?;
    Ok(())
}
