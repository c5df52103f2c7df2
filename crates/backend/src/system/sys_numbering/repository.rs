use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contracts::system::sys_numbering::{
    NumberFormat, ResetFrequency, SequenceConfig, SequenceKey, SequenceState,
};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseBackend, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, Statement, TransactionTrait, Value,
};

use super::error::PersistenceError;
use super::registry::{Counter, SequenceRegistry};

pub mod sequence_config {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "sys_sequence_config")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub domain: String,
        pub seq_key: String,
        pub prefix: String,
        pub suffix: Option<String>,
        pub template: Option<String>,
        pub format: String,
        pub number_length: i32,
        pub separator: String,
        pub start_from: i64,
        pub increment: i64,
        pub reset_frequency: String,
        pub include_check_digit: bool,
        pub enabled: bool,
        pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod sequence_state {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "sys_sequence_state")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub domain: String,
        pub seq_key: String,
        pub current_number: i64,
        pub last_reset_at: Option<chrono::DateTime<chrono::Utc>>,
        pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

impl TryFrom<sequence_config::Model> for SequenceConfig {
    type Error = PersistenceError;

    fn try_from(m: sequence_config::Model) -> Result<Self, Self::Error> {
        let invalid = |what: &str, value: &str| {
            PersistenceError::InvalidData(format!("{} '{}' in {}", what, value, m.id))
        };
        let key = SequenceKey {
            domain: m.domain.clone(),
            name: m.seq_key.clone(),
        };
        let format = NumberFormat::from_code(&m.format).ok_or_else(|| invalid("format", &m.format))?;
        let reset_frequency = ResetFrequency::from_code(&m.reset_frequency)
            .ok_or_else(|| invalid("reset_frequency", &m.reset_frequency))?;
        let number_length = u32::try_from(m.number_length)
            .map_err(|_| invalid("number_length", &m.number_length.to_string()))?;

        Ok(SequenceConfig {
            key,
            prefix: m.prefix,
            suffix: m.suffix,
            template: m.template,
            format,
            number_length,
            separator: m.separator,
            start_from: m.start_from,
            increment: m.increment,
            reset_frequency,
            include_check_digit: m.include_check_digit,
            enabled: m.enabled,
            updated_at: m.updated_at,
        })
    }
}

fn raw(sql: &str, values: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DatabaseBackend::Sqlite, sql, values)
}

/// Строка состояния ключа, в которой счетчик и начало периода равны `expected`
fn observed_state(key: &SequenceKey, expected: Counter) -> Condition {
    use sequence_state::Column;

    let period = match expected.last_reset_at {
        Some(at) => Column::LastResetAt.eq(at),
        None => Column::LastResetAt.is_null(),
    };
    Condition::all()
        .add(Column::Id.eq(key.state_storage_key()))
        .add(Column::CurrentNumber.eq(expected.current_number))
        .add(period)
}

const ENSURE_STATE_ROW: &str = r#"
    INSERT OR IGNORE INTO sys_sequence_state (id, domain, seq_key, current_number, updated_at)
    VALUES (?, ?, ?, 0, ?);
"#;

const CLAIM_CODE: &str = r#"
    INSERT OR IGNORE INTO sys_sequence_used_code (state_id, code, issued_at)
    VALUES (?, ?, ?);
"#;

/// Хранилище нумераторов в SQLite.
///
/// Счетчик двигается одним `UPDATE ... WHERE current_number = ?`, коды
/// занимаются через `INSERT OR IGNORE` по первичному ключу `(state_id, code)`,
/// поэтому несколько процессов на одном файле не выдают дублей.
#[derive(Clone)]
pub struct SqliteRegistry {
    conn: DatabaseConnection,
}

impl SqliteRegistry {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    async fn ensure_state_row<C: ConnectionTrait>(
        conn: &C,
        key: &SequenceKey,
    ) -> Result<(), PersistenceError> {
        conn.execute(raw(
            ENSURE_STATE_ROW,
            vec![
                key.state_storage_key().into(),
                key.domain.clone().into(),
                key.name.clone().into(),
                Utc::now().to_rfc3339().into(),
            ],
        ))
        .await?;
        Ok(())
    }

    async fn delete_codes<C: ConnectionTrait>(
        conn: &C,
        key: &SequenceKey,
    ) -> Result<u64, PersistenceError> {
        let result = conn
            .execute(raw(
                "DELETE FROM sys_sequence_used_code WHERE state_id = ?;",
                vec![key.state_storage_key().into()],
            ))
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_code<C: ConnectionTrait>(
        conn: &C,
        key: &SequenceKey,
        code: &str,
    ) -> Result<bool, PersistenceError> {
        let result = conn
            .execute(raw(
                CLAIM_CODE,
                vec![
                    key.state_storage_key().into(),
                    code.to_string().into(),
                    Utc::now().to_rfc3339().into(),
                ],
            ))
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SequenceRegistry for SqliteRegistry {
    async fn get_config(
        &self,
        key: &SequenceKey,
    ) -> Result<Option<SequenceConfig>, PersistenceError> {
        sequence_config::Entity::find_by_id(key.config_storage_key())
            .one(&self.conn)
            .await?
            .map(SequenceConfig::try_from)
            .transpose()
    }

    async fn put_config(&self, config: &SequenceConfig) -> Result<(), PersistenceError> {
        use sequence_config::Column;

        let active = sequence_config::ActiveModel {
            id: Set(config.key.config_storage_key()),
            domain: Set(config.key.domain.clone()),
            seq_key: Set(config.key.name.clone()),
            prefix: Set(config.prefix.clone()),
            suffix: Set(config.suffix.clone()),
            template: Set(config.template.clone()),
            format: Set(config.format.code().to_string()),
            number_length: Set(config.number_length as i32),
            separator: Set(config.separator.clone()),
            start_from: Set(config.start_from),
            increment: Set(config.increment),
            reset_frequency: Set(config.reset_frequency.code().to_string()),
            include_check_digit: Set(config.include_check_digit),
            enabled: Set(config.enabled),
            updated_at: Set(config.updated_at),
        };
        sequence_config::Entity::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Prefix,
                        Column::Suffix,
                        Column::Template,
                        Column::Format,
                        Column::NumberLength,
                        Column::Separator,
                        Column::StartFrom,
                        Column::Increment,
                        Column::ResetFrequency,
                        Column::IncludeCheckDigit,
                        Column::Enabled,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    async fn delete_config(&self, key: &SequenceKey) -> Result<bool, PersistenceError> {
        let result = sequence_config::Entity::delete_by_id(key.config_storage_key())
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn list_configs(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<SequenceConfig>, PersistenceError> {
        use sequence_config::Column;

        let mut query = sequence_config::Entity::find();
        if let Some(domain) = domain {
            query = query.filter(Column::Domain.eq(domain));
        }
        query
            .order_by_asc(Column::Domain)
            .order_by_asc(Column::SeqKey)
            .all(&self.conn)
            .await?
            .into_iter()
            .map(SequenceConfig::try_from)
            .collect()
    }

    async fn get_state(&self, key: &SequenceKey) -> Result<SequenceState, PersistenceError> {
        let counter = self.get_counter(key).await?;
        let rows = self
            .conn
            .query_all(raw(
                "SELECT code FROM sys_sequence_used_code WHERE state_id = ?;",
                vec![key.state_storage_key().into()],
            ))
            .await?;
        let mut state = SequenceState {
            current_number: counter.current_number,
            last_reset_at: counter.last_reset_at,
            ..Default::default()
        };
        for row in rows {
            state.used_codes.insert(row.try_get::<String>("", "code")?);
        }
        Ok(state)
    }

    async fn get_counter(&self, key: &SequenceKey) -> Result<Counter, PersistenceError> {
        let row = sequence_state::Entity::find_by_id(key.state_storage_key())
            .one(&self.conn)
            .await?;
        Ok(row
            .map(|m| Counter {
                current_number: m.current_number,
                last_reset_at: m.last_reset_at,
            })
            .unwrap_or_default())
    }

    async fn put_state(
        &self,
        key: &SequenceKey,
        state: &SequenceState,
    ) -> Result<(), PersistenceError> {
        use sequence_state::Column;

        let txn = self.conn.begin().await?;
        let active = sequence_state::ActiveModel {
            id: Set(key.state_storage_key()),
            domain: Set(key.domain.clone()),
            seq_key: Set(key.name.clone()),
            current_number: Set(state.current_number),
            last_reset_at: Set(state.last_reset_at),
            updated_at: Set(Some(Utc::now())),
        };
        sequence_state::Entity::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::CurrentNumber, Column::LastResetAt, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&txn)
            .await?;
        Self::delete_codes(&txn, key).await?;
        for code in &state.used_codes {
            Self::insert_code(&txn, key, code).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn delete_state(&self, key: &SequenceKey) -> Result<bool, PersistenceError> {
        let txn = self.conn.begin().await?;
        let result = sequence_state::Entity::delete_by_id(key.state_storage_key())
            .exec(&txn)
            .await?;
        let codes = Self::delete_codes(&txn, key).await?;
        txn.commit().await?;
        Ok(result.rows_affected > 0 || codes > 0)
    }

    async fn compare_and_set_counter(
        &self,
        key: &SequenceKey,
        expected: Counter,
        next: i64,
    ) -> Result<bool, PersistenceError> {
        use sequence_state::Column;

        Self::ensure_state_row(&self.conn, key).await?;
        let result = sequence_state::Entity::update_many()
            .col_expr(Column::CurrentNumber, Expr::value(next))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(observed_state(key, expected))
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn reset_period(
        &self,
        key: &SequenceKey,
        expected: Counter,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        use sequence_state::Column;

        let txn = self.conn.begin().await?;
        let result = sequence_state::Entity::update_many()
            .col_expr(Column::CurrentNumber, Expr::value(0i64))
            .col_expr(Column::LastResetAt, Expr::value(at))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(observed_state(key, expected))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            txn.rollback().await?;
            return Ok(false);
        }
        Self::delete_codes(&txn, key).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn start_period(
        &self,
        key: &SequenceKey,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        use sequence_state::Column;

        Self::ensure_state_row(&self.conn, key).await?;
        let result = sequence_state::Entity::update_many()
            .col_expr(Column::LastResetAt, Expr::value(at))
            .filter(Column::Id.eq(key.state_storage_key()))
            .filter(Column::LastResetAt.is_null())
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn claim_code(&self, key: &SequenceKey, code: &str) -> Result<bool, PersistenceError> {
        Self::insert_code(&self.conn, key, code).await
    }

    async fn release_code(
        &self,
        key: &SequenceKey,
        code: &str,
    ) -> Result<bool, PersistenceError> {
        let result = self
            .conn
            .execute(raw(
                "DELETE FROM sys_sequence_used_code WHERE state_id = ? AND code = ?;",
                vec![key.state_storage_key().into(), code.to_string().into()],
            ))
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::data::db;
    use chrono::TimeZone;

    async fn open(dir: &tempfile::TempDir) -> SqliteRegistry {
        let conn = db::connect(&dir.path().join("numbering.db")).await.unwrap();
        SqliteRegistry::new(conn)
    }

    fn key() -> SequenceKey {
        SequenceKey::new("sales", "invoice").unwrap()
    }

    #[tokio::test]
    async fn test_config_roundtrip_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;

        let mut config = SequenceConfig::new(key(), "INV")
            .with_template("{prefix}-{year}-{number:0000}")
            .with_reset(ResetFrequency::Yearly);
        config.suffix = Some("A".into());
        config.include_check_digit = true;
        registry.put_config(&config).await.unwrap();
        assert_eq!(registry.get_config(&key()).await.unwrap(), Some(config.clone()));

        config.prefix = "INV2".into();
        config.enabled = false;
        registry.put_config(&config).await.unwrap();
        let loaded = registry.get_config(&key()).await.unwrap().unwrap();
        assert_eq!(loaded.prefix, "INV2");
        assert!(!loaded.enabled);

        assert_eq!(registry.list_configs(None).await.unwrap().len(), 1);
        assert!(registry.list_configs(Some("logistics")).await.unwrap().is_empty());

        assert!(registry.delete_config(&key()).await.unwrap());
        assert!(registry.get_config(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;
        assert!(registry.get_state(&key()).await.unwrap().is_fresh());

        let mut state = SequenceState {
            current_number: 7,
            last_reset_at: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        state.used_codes.insert("INV-0007".into());
        state.used_codes.insert("INV-9999".into());
        registry.put_state(&key(), &state).await.unwrap();
        assert_eq!(registry.get_state(&key()).await.unwrap(), state);

        state.used_codes.remove("INV-9999");
        registry.put_state(&key(), &state).await.unwrap();
        assert_eq!(registry.get_state(&key()).await.unwrap().used_codes.len(), 1);

        assert!(registry.delete_state(&key()).await.unwrap());
        assert!(registry.get_state(&key()).await.unwrap().is_fresh());
    }

    #[tokio::test]
    async fn test_counter_compare_and_set() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;

        let zero = Counter::default();
        let one = Counter {
            current_number: 1,
            last_reset_at: None,
        };
        assert!(registry.compare_and_set_counter(&key(), zero, 1).await.unwrap());
        assert!(!registry.compare_and_set_counter(&key(), zero, 1).await.unwrap());
        assert!(registry.compare_and_set_counter(&key(), one, 2).await.unwrap());
        assert_eq!(registry.get_counter(&key()).await.unwrap().current_number, 2);
    }

    #[tokio::test]
    async fn test_reset_period_and_codes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir).await;
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        assert!(registry.start_period(&key(), at).await.unwrap());
        assert!(!registry.start_period(&key(), at).await.unwrap());

        let started = registry.get_counter(&key()).await.unwrap();
        assert_eq!(started.last_reset_at, Some(at));
        assert!(registry.compare_and_set_counter(&key(), started, 3).await.unwrap());
        assert!(registry.claim_code(&key(), "INV-0003").await.unwrap());
        assert!(!registry.claim_code(&key(), "INV-0003").await.unwrap());

        let seen = registry.get_counter(&key()).await.unwrap();
        let wrong_number = Counter {
            current_number: 2,
            ..seen
        };
        let wrong_period = Counter {
            last_reset_at: None,
            ..seen
        };
        let later = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        assert!(!registry.reset_period(&key(), wrong_number, later).await.unwrap());
        assert!(!registry.reset_period(&key(), wrong_period, later).await.unwrap());
        assert_eq!(registry.get_state(&key()).await.unwrap().used_codes.len(), 1);

        assert!(registry.reset_period(&key(), seen, later).await.unwrap());
        let state = registry.get_state(&key()).await.unwrap();
        assert_eq!(state.current_number, 0);
        assert!(state.used_codes.is_empty());
        assert_eq!(state.last_reset_at, Some(later));

        assert!(registry.claim_code(&key(), "INV-0001").await.unwrap());
        assert!(registry.release_code(&key(), "INV-0001").await.unwrap());
        assert!(!registry.release_code(&key(), "INV-0001").await.unwrap());
    }

    #[tokio::test]
    async fn test_two_connections_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = open(&dir).await;
        let second = open(&dir).await;

        assert!(first.claim_code(&key(), "INV-0001").await.unwrap());
        assert!(!second.claim_code(&key(), "INV-0001").await.unwrap());

        let seen = second.get_counter(&key()).await.unwrap();
        let next = seen.current_number + 1;
        assert!(first.compare_and_set_counter(&key(), seen, next).await.unwrap());
        assert!(!second.compare_and_set_counter(&key(), seen, next).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_over_a_newer_period_is_rejected_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let first = open(&dir).await;
        let second = open(&dir).await;
        let day1 = Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 1, 16, 8, 0, 0).unwrap();

        first.start_period(&key(), day1).await.unwrap();
        let started = first.get_counter(&key()).await.unwrap();
        first.compare_and_set_counter(&key(), started, 1).await.unwrap();
        let seen_on_day1 = second.get_counter(&key()).await.unwrap();

        assert!(first.reset_period(&key(), seen_on_day1, day2).await.unwrap());
        let fresh = first.get_counter(&key()).await.unwrap();
        assert!(first.compare_and_set_counter(&key(), fresh, 1).await.unwrap());
        assert!(first.claim_code(&key(), "INV-0001").await.unwrap());

        assert!(!second.reset_period(&key(), seen_on_day1, day2).await.unwrap());
        assert!(!second.compare_and_set_counter(&key(), seen_on_day1, 2).await.unwrap());
        assert!(!second.claim_code(&key(), "INV-0001").await.unwrap());
        let counter = second.get_counter(&key()).await.unwrap();
        assert_eq!(counter.current_number, 1);
        assert_eq!(counter.last_reset_at, Some(day2));
    }
}
