use once_cell::sync::OnceCell;
use sea_orm::{ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Statement};
use std::path::Path;

static DB_CONN: OnceCell<DatabaseConnection> = OnceCell::new();

const SCHEMA: &[(&str, &str)] = &[
    (
        "sys_sequence_config",
        r#"
        CREATE TABLE IF NOT EXISTS sys_sequence_config (
            id TEXT PRIMARY KEY NOT NULL,
            domain TEXT NOT NULL,
            seq_key TEXT NOT NULL,
            prefix TEXT NOT NULL DEFAULT '',
            suffix TEXT,
            template TEXT,
            format TEXT NOT NULL DEFAULT 'prefix-number',
            number_length INTEGER NOT NULL DEFAULT 4,
            separator TEXT NOT NULL DEFAULT '-',
            start_from INTEGER NOT NULL DEFAULT 1,
            increment INTEGER NOT NULL DEFAULT 1,
            reset_frequency TEXT NOT NULL DEFAULT 'never',
            include_check_digit INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        );
        "#,
    ),
    (
        "idx_sys_sequence_config_domain_key",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sys_sequence_config_domain_key
            ON sys_sequence_config (domain, seq_key);
        "#,
    ),
    (
        "sys_sequence_state",
        r#"
        CREATE TABLE IF NOT EXISTS sys_sequence_state (
            id TEXT PRIMARY KEY NOT NULL,
            domain TEXT NOT NULL,
            seq_key TEXT NOT NULL,
            current_number INTEGER NOT NULL DEFAULT 0,
            last_reset_at TEXT,
            updated_at TEXT
        );
        "#,
    ),
    (
        "sys_sequence_used_code",
        r#"
        CREATE TABLE IF NOT EXISTS sys_sequence_used_code (
            state_id TEXT NOT NULL,
            code TEXT NOT NULL,
            issued_at TEXT NOT NULL,
            PRIMARY KEY (state_id, code)
        );
        "#,
    ),
];

fn build_sqlite_url(path: &Path) -> String {
    // Normalize path separators and ensure proper URL form on Windows
    let normalized = path.to_string_lossy().replace('\\', "/");
    let needs_leading_slash = !normalized.starts_with('/') && normalized.contains(':');
    let prefix = if needs_leading_slash { "/" } else { "" };
    format!("sqlite://{}{}?mode=rwc", prefix, normalized)
}

/// Открывает (или создает) файл SQLite и приводит схему к актуальной
pub async fn connect(db_file: &Path) -> anyhow::Result<DatabaseConnection> {
    if let Some(parent) = db_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let absolute_path = if db_file.is_absolute() {
        db_file.to_path_buf()
    } else {
        std::env::current_dir()?.join(db_file)
    };

    let conn = Database::connect(build_sqlite_url(&absolute_path)).await?;
    bootstrap_schema(&conn).await?;
    Ok(conn)
}

/// Ensure required tables exist (minimal schema bootstrap)
pub async fn bootstrap_schema(conn: &DatabaseConnection) -> anyhow::Result<()> {
    for (name, sql) in SCHEMA {
        tracing::debug!("Ensuring {}", name);
        conn.execute(Statement::from_string(
            DatabaseBackend::Sqlite,
            sql.to_string(),
        ))
        .await?;
    }
    Ok(())
}

pub async fn initialize_database(db_file: &Path) -> anyhow::Result<()> {
    let conn = connect(db_file).await?;
    tracing::info!("Database ready: {}", db_file.display());
    DB_CONN
        .set(conn)
        .map_err(|_| anyhow::anyhow!("Database connection already initialized"))?;
    Ok(())
}

pub fn get_connection() -> anyhow::Result<&'static DatabaseConnection> {
    DB_CONN
        .get()
        .ok_or_else(|| anyhow::anyhow!("Database connection has not been initialized"))
}
