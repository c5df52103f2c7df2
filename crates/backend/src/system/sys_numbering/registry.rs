use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contracts::system::sys_numbering::{SequenceConfig, SequenceKey, SequenceState};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::PersistenceError;

/// Счетчик без набора выданных кодов
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub current_number: i64,
    pub last_reset_at: Option<DateTime<Utc>>,
}

impl From<&SequenceState> for Counter {
    fn from(state: &SequenceState) -> Self {
        Self {
            current_number: state.current_number,
            last_reset_at: state.last_reset_at,
        }
    }
}

/// Хранилище настроек и состояний нумераторов.
///
/// Никакой бизнес-логики: ни сбросов, ни форматирования.
/// Операции `compare_and_set_counter`, `reset_period`, `start_period` и
/// `claim_code` обязаны быть атомарными относительно всех процессов,
/// работающих с тем же хранилищем. Реализация, где это не так, не защищает
/// от дублей при нескольких экземплярах сервиса.
#[async_trait]
pub trait SequenceRegistry: Send + Sync {
    async fn get_config(&self, key: &SequenceKey)
        -> Result<Option<SequenceConfig>, PersistenceError>;

    async fn put_config(&self, config: &SequenceConfig) -> Result<(), PersistenceError>;

    async fn delete_config(&self, key: &SequenceKey) -> Result<bool, PersistenceError>;

    /// Все настройки (или только одного домена), по возрастанию ключа
    async fn list_configs(&self, domain: Option<&str>)
        -> Result<Vec<SequenceConfig>, PersistenceError>;

    /// Нулевое состояние, если записи нет
    async fn get_state(&self, key: &SequenceKey) -> Result<SequenceState, PersistenceError>;

    async fn get_counter(&self, key: &SequenceKey) -> Result<Counter, PersistenceError>;

    async fn put_state(
        &self,
        key: &SequenceKey,
        state: &SequenceState,
    ) -> Result<(), PersistenceError>;

    async fn delete_state(&self, key: &SequenceKey) -> Result<bool, PersistenceError>;

    /// `current_number = next`, только если счетчик и начало периода
    /// все еще равны `expected`
    async fn compare_and_set_counter(
        &self,
        key: &SequenceKey,
        expected: Counter,
        next: i64,
    ) -> Result<bool, PersistenceError>;

    /// Обнуляет счетчик и набор кодов, если счетчик и начало периода
    /// все еще равны `expected`
    async fn reset_period(
        &self,
        key: &SequenceKey,
        expected: Counter,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Записывает начало периода, если оно еще не записано
    async fn start_period(
        &self,
        key: &SequenceKey,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Добавляет код в набор выданных; `false`, если он уже там
    async fn claim_code(&self, key: &SequenceKey, code: &str) -> Result<bool, PersistenceError>;

    async fn release_code(&self, key: &SequenceKey, code: &str)
        -> Result<bool, PersistenceError>;
}

trait LockResultExt<T> {
    fn map_lock_err(self) -> Result<T, PersistenceError>;
}

impl<'a, T> LockResultExt<RwLockReadGuard<'a, T>>
    for Result<RwLockReadGuard<'a, T>, PoisonError<RwLockReadGuard<'a, T>>>
{
    fn map_lock_err(self) -> Result<RwLockReadGuard<'a, T>, PersistenceError> {
        self.map_err(|e| PersistenceError::LockPoisoned(e.to_string()))
    }
}

impl<'a, T> LockResultExt<RwLockWriteGuard<'a, T>>
    for Result<RwLockWriteGuard<'a, T>, PoisonError<RwLockWriteGuard<'a, T>>>
{
    fn map_lock_err(self) -> Result<RwLockWriteGuard<'a, T>, PersistenceError> {
        self.map_err(|e| PersistenceError::LockPoisoned(e.to_string()))
    }
}

/// Хранилище в памяти процесса.
///
/// Документы лежат JSON-строками под ключами `domain:sequence:config:key` и
/// `domain:sequence:state:key`, как в локальном хранилище браузера.
/// Все изменения выполняются под одной блокировкой записи.
#[derive(Default)]
pub struct MemoryRegistry {
    documents: RwLock<HashMap<String, String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Сырые документы (для отладки и тестов)
    pub fn dump(&self) -> Result<HashMap<String, String>, PersistenceError> {
        Ok(self.documents.read().map_lock_err()?.clone())
    }

    fn read_state(
        documents: &HashMap<String, String>,
        key: &SequenceKey,
    ) -> Result<SequenceState, PersistenceError> {
        match documents.get(&key.state_storage_key()) {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(SequenceState::default()),
        }
    }

    fn write_state(
        documents: &mut HashMap<String, String>,
        key: &SequenceKey,
        state: &SequenceState,
    ) -> Result<(), PersistenceError> {
        documents.insert(key.state_storage_key(), serde_json::to_string(state)?);
        Ok(())
    }

    /// Read-modify-write состояния под блокировкой записи
    fn update_state<F>(&self, key: &SequenceKey, f: F) -> Result<bool, PersistenceError>
    where
        F: FnOnce(&mut SequenceState) -> bool,
    {
        let mut documents = self.documents.write().map_lock_err()?;
        let mut state = Self::read_state(&documents, key)?;
        if !f(&mut state) {
            return Ok(false);
        }
        Self::write_state(&mut documents, key, &state)?;
        Ok(true)
    }
}

#[async_trait]
impl SequenceRegistry for MemoryRegistry {
    async fn get_config(
        &self,
        key: &SequenceKey,
    ) -> Result<Option<SequenceConfig>, PersistenceError> {
        let documents = self.documents.read().map_lock_err()?;
        match documents.get(&key.config_storage_key()) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn put_config(&self, config: &SequenceConfig) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(config)?;
        self.documents
            .write()
            .map_lock_err()?
            .insert(config.key.config_storage_key(), json);
        Ok(())
    }

    async fn delete_config(&self, key: &SequenceKey) -> Result<bool, PersistenceError> {
        let mut documents = self.documents.write().map_lock_err()?;
        Ok(documents.remove(&key.config_storage_key()).is_some())
    }

    async fn list_configs(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<SequenceConfig>, PersistenceError> {
        let documents = self.documents.read().map_lock_err()?;
        let mut configs = Vec::new();
        for (storage_key, json) in documents.iter() {
            if !storage_key.contains(":sequence:config:") {
                continue;
            }
            let config: SequenceConfig = serde_json::from_str(json)?;
            if domain.map_or(true, |d| config.key.domain == d) {
                configs.push(config);
            }
        }
        configs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(configs)
    }

    async fn get_state(&self, key: &SequenceKey) -> Result<SequenceState, PersistenceError> {
        let documents = self.documents.read().map_lock_err()?;
        Self::read_state(&documents, key)
    }

    async fn get_counter(&self, key: &SequenceKey) -> Result<Counter, PersistenceError> {
        let state = self.get_state(key).await?;
        Ok(Counter::from(&state))
    }

    async fn put_state(
        &self,
        key: &SequenceKey,
        state: &SequenceState,
    ) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().map_lock_err()?;
        Self::write_state(&mut documents, key, state)
    }

    async fn delete_state(&self, key: &SequenceKey) -> Result<bool, PersistenceError> {
        let mut documents = self.documents.write().map_lock_err()?;
        Ok(documents.remove(&key.state_storage_key()).is_some())
    }

    async fn compare_and_set_counter(
        &self,
        key: &SequenceKey,
        expected: Counter,
        next: i64,
    ) -> Result<bool, PersistenceError> {
        self.update_state(key, |state| {
            if Counter::from(&*state) != expected {
                return false;
            }
            state.current_number = next;
            true
        })
    }

    async fn reset_period(
        &self,
        key: &SequenceKey,
        expected: Counter,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.update_state(key, |state| {
            if Counter::from(&*state) != expected {
                return false;
            }
            state.current_number = 0;
            state.used_codes.clear();
            state.last_reset_at = Some(at);
            true
        })
    }

    async fn start_period(
        &self,
        key: &SequenceKey,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.update_state(key, |state| {
            if state.last_reset_at.is_some() {
                return false;
            }
            state.last_reset_at = Some(at);
            true
        })
    }

    async fn claim_code(&self, key: &SequenceKey, code: &str) -> Result<bool, PersistenceError> {
        self.update_state(key, |state| state.used_codes.insert(code.to_string()))
    }

    async fn release_code(
        &self,
        key: &SequenceKey,
        code: &str,
    ) -> Result<bool, PersistenceError> {
        self.update_state(key, |state| state.used_codes.remove(code))
    }
}
