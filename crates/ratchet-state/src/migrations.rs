//! SurrealDB schema migrations
//!
//! Defines the tables backing the storage traits. Safe to call on every
//! connection (`IF NOT EXISTS`).

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Ratchet tables.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Ratchet SurrealDB schema");

    init_audit_table(db).await?;
    init_versions_table(db).await?;
    init_proposals_table(db).await?;

    info!("Ratchet schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, table: &str, sql: &str) -> Result<()> {
    debug!(table, "defining table");
    db.query(sql)
        .await
        .and_then(|r| r.check())
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}

/// `audit_entries`: append-only. Deletion is permitted only for the
/// retention purge; there is no update path in the store.
///
/// ```text
/// TABLE audit_entries {
///   seq:            INT (unique)
///   timestamp:      DATETIME (indexed)
///   operation_json: STRING
///   decision_json:  STRING
///   actor:          STRING
///   detail:         STRING
/// }
/// ```
async fn init_audit_table(db: &Surreal<Any>) -> Result<()> {
    run(
        db,
        "audit_entries",
        r#"
        DEFINE TABLE IF NOT EXISTS audit_entries SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_audit_seq ON TABLE audit_entries COLUMNS seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_audit_ts ON TABLE audit_entries COLUMNS timestamp;
        "#,
    )
    .await
}

/// `versions` plus the single-row `archive_head` pointer table.
///
/// ```text
/// TABLE versions {
///   version_id:     STRING (unique)
///   parent_id:      STRING?
///   diff_json:      STRING
///   content_digest: STRING
///   accepted_score: FLOAT
///   accepted_at:    DATETIME
///   proposal_id:    STRING?
///   ordinal:        INT (insertion order)
/// }
/// TABLE archive_head { version_id: STRING }   -- record archive_head:current
/// ```
async fn init_versions_table(db: &Surreal<Any>) -> Result<()> {
    run(
        db,
        "versions",
        r#"
        DEFINE TABLE IF NOT EXISTS versions SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_version_id ON TABLE versions COLUMNS version_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_version_ordinal ON TABLE versions COLUMNS ordinal;
        DEFINE TABLE IF NOT EXISTS archive_head SCHEMALESS;
        "#,
    )
    .await
}

/// `proposals`: one row per terminal proposal.
///
/// ```text
/// TABLE proposals {
///   proposal_id:      STRING (unique)
///   outcome:          STRING (archived | discarded | quarantined)
///   reason:           STRING?
///   payload_json:     STRING
///   recorded_at:      DATETIME
///   disposition_json: STRING?
///   ordinal:          INT
/// }
/// ```
async fn init_proposals_table(db: &Surreal<Any>) -> Result<()> {
    run(
        db,
        "proposals",
        r#"
        DEFINE TABLE IF NOT EXISTS proposals SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_proposal_id ON TABLE proposals COLUMNS proposal_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_proposal_outcome ON TABLE proposals COLUMNS outcome;
        "#,
    )
    .await
}
