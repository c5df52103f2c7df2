use chrono::{DateTime, FixedOffset, Offset, Utc};
use contracts::system::sys_numbering::{
    IssuedNumber, NumberFormat, ResetFrequency, SequenceConfig, SequenceConfigPatch, SequenceKey,
    SequenceSnapshot, SequenceState,
};
use std::sync::Arc;

use super::clock::{Clock, SystemClock};
use super::defaults;
use super::error::{NumberingError, NumberingResult};
use super::formatter::format_code;
use super::registry::{Counter, SequenceRegistry};
use super::reset::should_reset;
use super::template;
use super::validator::is_valid_code;
use crate::shared::config::NumberingConfig;

/// Сколько раз `generate` перечитывает состояние после смены периода или
/// проигранного compare-and-set. Коллизии кодов сюда не входят.
const RACE_RETRY_LIMIT: u32 = 10_000;

/// Генератор номеров документов и справочников.
///
/// Один движок на все домены: настройки и состояние ищутся по `SequenceKey`.
/// Безопасность между процессами обеспечивается атомарными операциями
/// хранилища (`compare_and_set_counter`, `claim_code`), а не чтением и записью.
pub struct SequenceService {
    registry: Arc<dyn SequenceRegistry>,
    clock: Arc<dyn Clock>,
    settings: NumberingConfig,
}

impl SequenceService {
    pub fn new(registry: Arc<dyn SequenceRegistry>, settings: NumberingConfig) -> Self {
        Self {
            registry,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &NumberingConfig {
        &self.settings
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.settings.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset())
    }

    /// Создает настройки и нулевое состояние, если их еще нет
    pub async fn initialize(
        &self,
        key: &SequenceKey,
        overrides: Option<SequenceConfigPatch>,
    ) -> NumberingResult<SequenceConfig> {
        check_key(key)?;
        if let Some(existing) = self.registry.get_config(key).await? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let mut config = defaults::default_for(key);
        if let Some(patch) = overrides {
            apply_patch(&mut config, patch)?;
        }
        check_config(&config)?;
        config.updated_at = Some(now);

        self.registry.put_config(&config).await?;
        // Существующее состояние (счетчик, коды) не трогаем
        self.registry.start_period(key, now).await?;

        tracing::info!(
            "Sequence {} initialized: prefix={}, reset={}",
            key,
            config.prefix,
            config.reset_frequency
        );
        Ok(config)
    }

    /// Настройки ключа; при `auto_initialize` неизвестный ключ создается
    async fn load_config(&self, key: &SequenceKey) -> NumberingResult<SequenceConfig> {
        match self.registry.get_config(key).await? {
            Some(config) => Ok(config),
            None if self.settings.auto_initialize => self.initialize(key, None).await,
            None => Err(NumberingError::NotFound(key.clone())),
        }
    }

    /// Настройки без записи в хранилище (для предпросмотра и проверки)
    async fn peek_config(&self, key: &SequenceKey) -> NumberingResult<SequenceConfig> {
        check_key(key)?;
        match self.registry.get_config(key).await? {
            Some(config) => Ok(config),
            None if self.settings.auto_initialize => Ok(defaults::default_for(key)),
            None => Err(NumberingError::NotFound(key.clone())),
        }
    }

    /// Переход в новый период, если граница пересечена.
    /// Возвращает `true`, если `counter` устарел и состояние нужно перечитать.
    async fn roll_period(
        &self,
        key: &SequenceKey,
        config: &SequenceConfig,
        counter: Counter,
        now: DateTime<Utc>,
    ) -> NumberingResult<bool> {
        if counter.last_reset_at.is_none() {
            self.registry.start_period(key, now).await?;
            return Ok(true);
        }
        if should_reset(
            config.reset_frequency,
            counter.last_reset_at,
            now,
            self.offset(),
        ) {
            if self
                .registry
                .reset_period(key, counter, now)
                .await?
            {
                tracing::info!(
                    "Sequence {} reset ({}) at counter {}",
                    key,
                    config.reset_frequency,
                    counter.current_number
                );
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Выдает следующий номер
    pub async fn generate(&self, key: &SequenceKey) -> NumberingResult<String> {
        let config = self.load_config(key).await?;
        if !config.enabled {
            return Err(NumberingError::Disabled(key.clone()));
        }

        let ceiling = self.settings.retry_ceiling;
        let mut collisions = 0;
        let mut races = 0;

        while collisions < ceiling {
            let now = self.clock.now();
            let counter = self.registry.get_counter(key).await?;
            if self.roll_period(key, &config, counter, now).await? {
                lost_race(key, &mut races)?;
                continue;
            }

            let next = config.next_counter(counter.current_number);
            if !self
                .registry
                .compare_and_set_counter(key, counter, next)
                .await?
            {
                tracing::warn!("Sequence {}: counter moved concurrently", key);
                lost_race(key, &mut races)?;
                continue;
            }

            let code = format_code(&config, next, self.local(period_time(counter, now)))?;
            if self.registry.claim_code(key, &code).await? {
                tracing::debug!("Sequence {} issued {}", key, code);
                return Ok(code);
            }
            collisions += 1;
            tracing::warn!(
                "Sequence {}: code {} already used, skipping (collision {})",
                key,
                code,
                collisions
            );
        }

        tracing::error!("Sequence {} exhausted after {} collisions", key, ceiling);
        Err(NumberingError::Exhausted {
            key: key.clone(),
            attempts: ceiling,
        })
    }

    /// Как `generate`, но при сбое хранилища выдает аварийный номер.
    ///
    /// Аварийный номер помечен `degraded = true`, не попадает в набор
    /// выданных кодов и не гарантирует уникальности.
    pub async fn generate_or_degraded(&self, key: &SequenceKey) -> NumberingResult<IssuedNumber> {
        match self.generate(key).await {
            Ok(code) => Ok(IssuedNumber::regular(code)),
            Err(NumberingError::Persistence(e)) => {
                let code = format!(
                    "{}-TMP-{}",
                    key.name.to_uppercase(),
                    self.local(self.clock.now()).format("%Y%m%d%H%M%S%3f")
                );
                tracing::error!(
                    "Sequence {}: storage failure ({}), issued DEGRADED number {}",
                    key,
                    e,
                    code
                );
                Ok(IssuedNumber::degraded(code))
            }
            Err(e) => Err(e),
        }
    }

    /// Какой номер выдаст следующий `generate` (ничего не записывает)
    pub async fn preview_next(&self, key: &SequenceKey) -> NumberingResult<String> {
        let config = self.peek_config(key).await?;
        if !config.enabled {
            return Err(NumberingError::Disabled(key.clone()));
        }

        let now = self.clock.now();
        let mut state = self.registry.get_state(key).await?;
        let stamp = if should_reset(
            config.reset_frequency,
            state.last_reset_at,
            now,
            self.offset(),
        ) {
            state.current_number = 0;
            state.used_codes.clear();
            now
        } else {
            period_time(Counter::from(&state), now)
        };

        let local = self.local(stamp);
        let mut current = state.current_number;
        for _ in 0..self.settings.retry_ceiling {
            let next = config.next_counter(current);
            let code = format_code(&config, next, local)?;
            if !state.used_codes.contains(&code) {
                return Ok(code);
            }
            current = next;
        }
        Err(NumberingError::Exhausted {
            key: key.clone(),
            attempts: self.settings.retry_ceiling,
        })
    }

    /// Резервирует номер, введенный вручную. Счетчик не меняется.
    pub async fn reserve_explicit(&self, key: &SequenceKey, code: &str) -> NumberingResult<bool> {
        let code = code.trim();
        if code.is_empty() {
            tracing::warn!("Sequence {}: refusing to reserve an empty code", key);
            return Ok(false);
        }
        let config = self.load_config(key).await?;
        let counter = self.registry.get_counter(key).await?;
        self.roll_period(key, &config, counter, self.clock.now()).await?;

        let reserved = self.registry.claim_code(key, code).await?;
        if reserved {
            tracing::info!("Sequence {}: reserved {}", key, code);
        }
        Ok(reserved)
    }

    /// Освобождает ранее выданный или зарезервированный номер
    pub async fn release(&self, key: &SequenceKey, code: &str) -> NumberingResult<bool> {
        check_key(key)?;
        let released = self.registry.release_code(key, code.trim()).await?;
        if released {
            tracing::info!("Sequence {}: released {}", key, code.trim());
        }
        Ok(released)
    }

    /// Соответствует ли номер формату последовательности
    pub async fn validate(&self, key: &SequenceKey, code: &str) -> NumberingResult<bool> {
        let config = self.peek_config(key).await?;
        is_valid_code(&config, code)
    }

    pub async fn get_config(&self, key: &SequenceKey) -> NumberingResult<Option<SequenceConfig>> {
        check_key(key)?;
        Ok(self.registry.get_config(key).await?)
    }

    pub async fn list_configs(&self, domain: Option<&str>) -> NumberingResult<Vec<SequenceConfig>> {
        Ok(self.registry.list_configs(domain).await?)
    }

    /// Частичное обновление настроек. Уже выданные номера не меняются.
    pub async fn update_config(
        &self,
        key: &SequenceKey,
        patch: SequenceConfigPatch,
    ) -> NumberingResult<SequenceConfig> {
        let mut config = self.load_config(key).await?;
        apply_patch(&mut config, patch)?;
        check_config(&config)?;
        config.updated_at = Some(self.clock.now());

        self.registry.put_config(&config).await?;
        tracing::info!(
            "Sequence {} updated: prefix={}, template={:?}, reset={}, enabled={}",
            key,
            config.prefix,
            config.template,
            config.reset_frequency,
            config.enabled
        );
        Ok(config)
    }

    /// Сброс последовательности.
    ///
    /// `preserve_config = true` обнуляет только состояние, иначе удаляются и
    /// настройки (следующее обращение снова возьмет значения по умолчанию).
    pub async fn reset_sequence(
        &self,
        key: &SequenceKey,
        preserve_config: bool,
    ) -> NumberingResult<()> {
        check_key(key)?;
        if preserve_config {
            let state = SequenceState {
                last_reset_at: Some(self.clock.now()),
                ..Default::default()
            };
            self.registry.put_state(key, &state).await?;
        } else {
            self.registry.delete_state(key).await?;
            self.registry.delete_config(key).await?;
        }
        tracing::info!(
            "Sequence {} reset manually (preserve_config={})",
            key,
            preserve_config
        );
        Ok(())
    }

    pub async fn export_snapshot(&self, key: &SequenceKey) -> NumberingResult<SequenceSnapshot> {
        check_key(key)?;
        let config = self
            .registry
            .get_config(key)
            .await?
            .ok_or_else(|| NumberingError::NotFound(key.clone()))?;
        let state = self.registry.get_state(key).await?;
        Ok(SequenceSnapshot::from_parts(config, state))
    }

    /// Заменяет настройки и состояние данными снимка
    pub async fn import_snapshot(&self, snapshot: SequenceSnapshot) -> NumberingResult<SequenceKey> {
        let (config, state) = snapshot.into_parts().map_err(NumberingError::Configuration)?;
        check_config(&config)?;

        self.registry.put_config(&config).await?;
        self.registry.put_state(&config.key, &state).await?;
        tracing::info!(
            "Sequence {} imported: counter={}, used codes={}",
            config.key,
            state.current_number,
            state.used_codes.len()
        );
        Ok(config.key)
    }
}

/// Номер не датируется раньше начала своего периода
fn period_time(counter: Counter, now: DateTime<Utc>) -> DateTime<Utc> {
    counter.last_reset_at.map_or(now, |start| start.max(now))
}

fn lost_race(key: &SequenceKey, races: &mut u32) -> NumberingResult<()> {
    *races += 1;
    if *races > RACE_RETRY_LIMIT {
        tracing::error!("Sequence {}: state keeps changing, giving up", key);
        return Err(NumberingError::Contended {
            key: key.clone(),
            retries: RACE_RETRY_LIMIT,
        });
    }
    Ok(())
}

fn check_key(key: &SequenceKey) -> NumberingResult<()> {
    key.validate().map_err(NumberingError::Configuration)
}

fn check_config(config: &SequenceConfig) -> NumberingResult<()> {
    config.validate().map_err(NumberingError::Configuration)?;
    template::layout(config).map_err(NumberingError::Configuration)?;
    Ok(())
}

fn apply_patch(config: &mut SequenceConfig, patch: SequenceConfigPatch) -> NumberingResult<()> {
    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

    if let Some(prefix) = patch.prefix {
        config.prefix = prefix;
    }
    if let Some(suffix) = patch.suffix {
        config.suffix = non_empty(suffix);
    }
    if let Some(template) = patch.template {
        config.template = non_empty(template);
    }
    if let Some(code) = patch.format {
        config.format = NumberFormat::from_code(&code)
            .ok_or_else(|| NumberingError::config(format!("Unknown format '{}'", code)))?;
    }
    if let Some(number_length) = patch.number_length {
        config.number_length = number_length;
    }
    if let Some(separator) = patch.separator {
        config.separator = separator;
    }
    if let Some(start_from) = patch.start_from {
        config.start_from = start_from;
    }
    if let Some(increment) = patch.increment {
        config.increment = increment;
    }
    if let Some(code) = patch.reset_frequency {
        config.reset_frequency = ResetFrequency::from_code(&code).ok_or_else(|| {
            NumberingError::config(format!("Unknown reset frequency '{}'", code))
        })?;
    }
    if let Some(include_check_digit) = patch.include_check_digit {
        config.include_check_digit = include_check_digit;
    }
    if let Some(enabled) = patch.enabled {
        config.enabled = enabled;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::sys_numbering::clock::FixedClock;
    use crate::system::sys_numbering::error::PersistenceError;
    use crate::system::sys_numbering::formatter::luhn_check_digit;
    use crate::system::sys_numbering::registry::{Counter, MemoryRegistry};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn settings() -> NumberingConfig {
        NumberingConfig::default()
    }

    fn service_at(now: DateTime<Utc>) -> (SequenceService, Arc<FixedClock>, Arc<MemoryRegistry>) {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FixedClock::new(now));
        let service = SequenceService::new(registry.clone(), settings()).with_clock(clock.clone());
        (service, clock, registry)
    }

    fn key(domain: &str, name: &str) -> SequenceKey {
        SequenceKey::new(domain, name).unwrap()
    }

    fn patch() -> SequenceConfigPatch {
        SequenceConfigPatch::default()
    }

    #[tokio::test]
    async fn test_invoice_scenario() {
        let (service, _, _) = service_at(utc(2025, 1, 15));
        let invoice = key("sales", "invoice");
        service
            .initialize(
                &invoice,
                Some(SequenceConfigPatch {
                    prefix: Some("INV".into()),
                    template: Some("{prefix}-{year}-{number:0000}".into()),
                    start_from: Some(1),
                    ..patch()
                }),
            )
            .await
            .unwrap();

        assert_eq!(service.generate(&invoice).await.unwrap(), "INV-2025-0001");
        assert_eq!(service.generate(&invoice).await.unwrap(), "INV-2025-0002");
    }

    #[tokio::test]
    async fn test_initialize_is_noop_when_config_exists() {
        let (service, _, _) = service_at(utc(2025, 1, 15));
        let k = key("sales", "quote");
        service.initialize(&k, None).await.unwrap();
        let again = service
            .initialize(
                &k,
                Some(SequenceConfigPatch {
                    prefix: Some("OTHER".into()),
                    ..patch()
                }),
            )
            .await
            .unwrap();
        assert_eq!(again.prefix, "QT");
    }

    #[tokio::test]
    async fn test_unknown_key_uses_generic_fallback() {
        let (service, _, _) = service_at(utc(2025, 1, 15));
        let k = key("crm", "tickets");
        assert_eq!(service.generate(&k).await.unwrap(), "TICKETS-0001");
        assert_eq!(service.generate(&k).await.unwrap(), "TICKETS-0002");
    }

    #[tokio::test]
    async fn test_monotonic_and_unique() {
        let (service, _, registry) = service_at(utc(2025, 1, 15));
        let k = key("master_data", "customers");
        service
            .initialize(
                &k,
                Some(SequenceConfigPatch {
                    increment: Some(3),
                    start_from: Some(10),
                    ..patch()
                }),
            )
            .await
            .unwrap();

        let mut codes = HashSet::new();
        let mut previous = None;
        for _ in 0..200 {
            codes.insert(service.generate(&k).await.unwrap());
            let current = registry.get_counter(&k).await.unwrap().current_number;
            if let Some(prev) = previous {
                assert_eq!(current, prev + 3);
            } else {
                assert_eq!(current, 10);
            }
            previous = Some(current);
        }
        assert_eq!(codes.len(), 200);
        assert!(codes.contains("CUS-00010"));
        assert!(codes.contains("CUS-00013"));
    }

    #[tokio::test]
    async fn test_daily_reset_restarts_counter_and_reissues_codes() {
        let (service, clock, _) = service_at(utc(2025, 1, 15));
        let k = key("logistics", "shipment");
        service
            .initialize(
                &k,
                Some(SequenceConfigPatch {
                    template: Some("{prefix}-{number:000}".into()),
                    ..patch()
                }),
            )
            .await
            .unwrap();

        assert_eq!(service.generate(&k).await.unwrap(), "SHP-001");
        assert_eq!(service.generate(&k).await.unwrap(), "SHP-002");

        clock.set(Utc.with_ymd_and_hms(2025, 1, 15, 23, 59, 59).unwrap());
        assert_eq!(service.generate(&k).await.unwrap(), "SHP-003");

        clock.advance(Duration::seconds(2));
        assert_eq!(service.preview_next(&k).await.unwrap(), "SHP-001");
        assert_eq!(service.generate(&k).await.unwrap(), "SHP-001");
        assert_eq!(service.generate(&k).await.unwrap(), "SHP-002");
    }

    #[tokio::test]
    async fn test_yearly_reset_across_new_year() {
        let (service, clock, registry) = service_at(utc(2024, 12, 31));
        let k = key("sales", "invoice");
        service.initialize(&k, None).await.unwrap();
        for _ in 0..5 {
            service.generate(&k).await.unwrap();
        }
        assert_eq!(registry.get_counter(&k).await.unwrap().current_number, 5);

        clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(service.generate(&k).await.unwrap(), "INV-2025-0001");
        let counter: Counter = registry.get_counter(&k).await.unwrap();
        assert_eq!(counter.current_number, 1);
        assert_eq!(counter.last_reset_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_reserved_code_is_skipped() {
        let (service, _, registry) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        service.initialize(&k, None).await.unwrap();
        assert!(service.reserve_explicit(&k, "INV-2025-9999").await.unwrap());
        assert!(!service.reserve_explicit(&k, "INV-2025-9999").await.unwrap());
        assert_eq!(registry.get_counter(&k).await.unwrap().current_number, 0);

        // Подводим счетчик вплотную к зарезервированному номеру
        let counter = registry.get_counter(&k).await.unwrap();
        registry.compare_and_set_counter(&k, counter, 9998).await.unwrap();
        assert_eq!(service.preview_next(&k).await.unwrap(), "INV-2025-10000");
        assert_eq!(service.generate(&k).await.unwrap(), "INV-2025-10000");
    }

    #[tokio::test]
    async fn test_release_makes_code_available() {
        let (service, _, registry) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        assert_eq!(service.generate(&k).await.unwrap(), "INV-2025-0001");
        assert!(service.release(&k, "INV-2025-0001").await.unwrap());
        assert!(!service.release(&k, "INV-2025-0001").await.unwrap());
        assert!(!registry.get_state(&k).await.unwrap().used_codes.contains("INV-2025-0001"));
    }

    #[tokio::test]
    async fn test_generated_codes_validate() {
        let (service, _, _) = service_at(utc(2025, 3, 9));
        for (domain, name) in [
            ("sales", "invoice"),
            ("sales", "sales_order"),
            ("logistics", "shipment"),
            ("master_data", "leads"),
            ("crm", "tickets"),
        ] {
            let k = key(domain, name);
            for _ in 0..3 {
                let code = service.generate(&k).await.unwrap();
                assert!(service.validate(&k, &code).await.unwrap(), "{}", code);
            }
        }
        assert!(!service
            .validate(&key("sales", "invoice"), "QT-2025-0001")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_check_digit_appended() {
        let (service, _, _) = service_at(utc(2025, 1, 15));
        let k = key("sales", "receipt");
        service
            .initialize(
                &k,
                Some(SequenceConfigPatch {
                    prefix: Some("PREFIX".into()),
                    include_check_digit: Some(true),
                    ..patch()
                }),
            )
            .await
            .unwrap();

        let code = service.generate(&k).await.unwrap();
        assert_eq!(code.len(), "PREFIX-0001".len() + 1);
        assert!(code.starts_with("PREFIX-0001"));
        let expected = luhn_check_digit("PREFIX-0001");
        assert_eq!(code.chars().last().unwrap().to_digit(10).unwrap(), expected as u32);
        assert!(service.validate(&k, &code).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_sequence_never_advances() {
        let (service, _, registry) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        service.generate(&k).await.unwrap();
        service
            .update_config(
                &k,
                SequenceConfigPatch {
                    enabled: Some(false),
                    ..patch()
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            service.generate(&k).await,
            Err(NumberingError::Disabled(_))
        ));
        assert!(matches!(
            service.preview_next(&k).await,
            Err(NumberingError::Disabled(_))
        ));
        assert_eq!(registry.get_counter(&k).await.unwrap().current_number, 1);
    }

    #[tokio::test]
    async fn test_exhausted_after_retry_ceiling() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FixedClock::new(utc(2025, 1, 15)));
        let service = SequenceService::new(
            registry.clone(),
            NumberingConfig {
                retry_ceiling: 5,
                ..settings()
            },
        )
        .with_clock(clock);
        let k = key("sales", "invoice");
        service.initialize(&k, None).await.unwrap();
        for n in 1..=5 {
            service
                .reserve_explicit(&k, &format!("INV-2025-{:04}", n))
                .await
                .unwrap();
        }

        match service.generate(&k).await {
            Err(NumberingError::Exhausted { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_without_auto_initialize() {
        let service = SequenceService::new(
            Arc::new(MemoryRegistry::new()),
            NumberingConfig {
                auto_initialize: false,
                ..settings()
            },
        );
        let k = key("sales", "invoice");
        assert!(matches!(
            service.generate(&k).await,
            Err(NumberingError::NotFound(_))
        ));
        assert!(matches!(
            service.preview_next(&k).await,
            Err(NumberingError::NotFound(_))
        ));
        assert!(matches!(
            service.validate(&k, "INV-2025-0001").await,
            Err(NumberingError::NotFound(_))
        ));

        service.initialize(&k, None).await.unwrap();
        assert!(service.generate(&k).await.is_ok());
    }

    #[tokio::test]
    async fn test_preview_does_not_write() {
        let (service, _, registry) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        assert_eq!(service.preview_next(&k).await.unwrap(), "INV-2025-0001");
        assert_eq!(service.preview_next(&k).await.unwrap(), "INV-2025-0001");
        assert!(registry.dump().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_config_rejects_bad_values() {
        let (service, _, _) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        for bad in [
            SequenceConfigPatch {
                template: Some("{prefix}-{seq}".into()),
                ..patch()
            },
            SequenceConfigPatch {
                number_length: Some(0),
                ..patch()
            },
            SequenceConfigPatch {
                reset_frequency: Some("weekly".into()),
                ..patch()
            },
            SequenceConfigPatch {
                format: Some("number-prefix".into()),
                ..patch()
            },
        ] {
            assert!(matches!(
                service.update_config(&k, bad).await,
                Err(NumberingError::Configuration(_))
            ));
        }
        assert_eq!(
            service.get_config(&k).await.unwrap().unwrap().template.as_deref(),
            Some("{prefix}-{year}-{number:0000}")
        );
    }

    #[tokio::test]
    async fn test_template_change_is_not_retroactive() {
        let (service, _, registry) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        assert_eq!(service.generate(&k).await.unwrap(), "INV-2025-0001");
        service
            .update_config(
                &k,
                SequenceConfigPatch {
                    template: Some(String::new()),
                    separator: Some("/".into()),
                    number_length: Some(6),
                    ..patch()
                },
            )
            .await
            .unwrap();

        assert_eq!(service.generate(&k).await.unwrap(), "INV/000002");
        let used = registry.get_state(&k).await.unwrap().used_codes;
        assert!(used.contains("INV-2025-0001"));
        assert!(used.contains("INV/000002"));
    }

    #[tokio::test]
    async fn test_reset_sequence_with_and_without_config() {
        let (service, _, _) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        service
            .update_config(
                &k,
                SequenceConfigPatch {
                    prefix: Some("BILL".into()),
                    ..patch()
                },
            )
            .await
            .unwrap();
        assert_eq!(service.generate(&k).await.unwrap(), "BILL-2025-0001");
        assert_eq!(service.generate(&k).await.unwrap(), "BILL-2025-0002");

        service.reset_sequence(&k, true).await.unwrap();
        assert_eq!(service.generate(&k).await.unwrap(), "BILL-2025-0001");

        service.reset_sequence(&k, false).await.unwrap();
        assert!(service.get_config(&k).await.unwrap().is_none());
        assert_eq!(service.generate(&k).await.unwrap(), "INV-2025-0001");
    }

    #[tokio::test]
    async fn test_snapshot_export_import() {
        let (source, _, _) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        source.generate(&k).await.unwrap();
        source.reserve_explicit(&k, "INV-2025-0002").await.unwrap();
        let snapshot = source.export_snapshot(&k).await.unwrap();
        assert_eq!(snapshot.current_number, 1);
        assert_eq!(snapshot.used_codes.len(), 2);

        let (target, _, _) = service_at(utc(2025, 1, 15));
        assert_eq!(target.import_snapshot(snapshot).await.unwrap(), k);
        assert_eq!(target.generate(&k).await.unwrap(), "INV-2025-0003");

        assert!(matches!(
            target.export_snapshot(&key("sales", "quote")).await,
            Err(NumberingError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_services_on_one_registry_never_duplicate() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FixedClock::new(utc(2025, 1, 15)));
        let k = key("sales", "invoice");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = SequenceService::new(registry.clone(), settings()).with_clock(clock.clone());
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let mut codes = Vec::new();
                for _ in 0..50 {
                    codes.push(service.generate(&k).await.unwrap());
                }
                codes
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for code in handle.await.unwrap() {
                assert!(all.insert(code.clone()), "duplicate {}", code);
            }
        }
        assert_eq!(all.len(), 200);
        assert_eq!(registry.get_counter(&k).await.unwrap().current_number, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_processes_on_one_sqlite_file_never_duplicate() {
        use crate::shared::data::db;
        use crate::system::sys_numbering::repository::SqliteRegistry;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let clock = Arc::new(FixedClock::new(utc(2025, 1, 15)));
        let k = key("logistics", "purchase_order");

        let mut handles = Vec::new();
        for _ in 0..2 {
            // Отдельный пул соединений на каждый "процесс"
            let registry = Arc::new(SqliteRegistry::new(db::connect(&path).await.unwrap()));
            let service = SequenceService::new(registry, settings()).with_clock(clock.clone());
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let mut codes = Vec::new();
                for _ in 0..25 {
                    codes.push(service.generate(&k).await.unwrap());
                }
                codes
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for code in handle.await.unwrap() {
                assert!(all.insert(code.clone()), "duplicate {}", code);
            }
        }
        assert_eq!(all.len(), 50);
        assert!(all.contains("PO-2025-0001"));
        assert!(all.contains("PO-2025-0050"));
    }

    #[tokio::test]
    async fn test_period_rollover_does_not_count_as_collision() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FixedClock::new(utc(2025, 1, 15)));
        let service = SequenceService::new(
            registry,
            NumberingConfig {
                retry_ceiling: 1,
                ..settings()
            },
        )
        .with_clock(clock.clone());
        let k = key("logistics", "shipment");

        // Первое обращение: создание настроек и начало периода
        assert_eq!(service.generate(&k).await.unwrap(), "SHP-20250115-001");
        clock.set(utc(2025, 1, 16));
        assert_eq!(service.generate(&k).await.unwrap(), "SHP-20250116-001");
        clock.set(utc(2025, 1, 17));
        assert_eq!(service.preview_next(&k).await.unwrap(), "SHP-20250117-001");
        assert_eq!(service.generate(&k).await.unwrap(), "SHP-20250117-001");
    }

    /// Перед каждым `reset_period` второй экземпляр сервиса успевает
    /// выполнить полный `generate` на том же хранилище
    struct InterleavedRegistry {
        inner: Arc<MemoryRegistry>,
        rival: SequenceService,
        rival_codes: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SequenceRegistry for InterleavedRegistry {
        async fn get_config(&self, key: &SequenceKey) -> Result<Option<SequenceConfig>, PersistenceError> {
            self.inner.get_config(key).await
        }
        async fn put_config(&self, config: &SequenceConfig) -> Result<(), PersistenceError> {
            self.inner.put_config(config).await
        }
        async fn delete_config(&self, key: &SequenceKey) -> Result<bool, PersistenceError> {
            self.inner.delete_config(key).await
        }
        async fn list_configs(&self, domain: Option<&str>) -> Result<Vec<SequenceConfig>, PersistenceError> {
            self.inner.list_configs(domain).await
        }
        async fn get_state(&self, key: &SequenceKey) -> Result<SequenceState, PersistenceError> {
            self.inner.get_state(key).await
        }
        async fn get_counter(&self, key: &SequenceKey) -> Result<Counter, PersistenceError> {
            self.inner.get_counter(key).await
        }
        async fn put_state(&self, key: &SequenceKey, state: &SequenceState) -> Result<(), PersistenceError> {
            self.inner.put_state(key, state).await
        }
        async fn delete_state(&self, key: &SequenceKey) -> Result<bool, PersistenceError> {
            self.inner.delete_state(key).await
        }
        async fn compare_and_set_counter(&self, key: &SequenceKey, expected: Counter, next: i64) -> Result<bool, PersistenceError> {
            self.inner.compare_and_set_counter(key, expected, next).await
        }
        async fn reset_period(&self, key: &SequenceKey, expected: Counter, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
            let code = self.rival.generate(key).await.unwrap();
            self.rival_codes.lock().unwrap().push(code);
            self.inner.reset_period(key, expected, at).await
        }
        async fn start_period(&self, key: &SequenceKey, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
            self.inner.start_period(key, at).await
        }
        async fn claim_code(&self, key: &SequenceKey, code: &str) -> Result<bool, PersistenceError> {
            self.inner.claim_code(key, code).await
        }
        async fn release_code(&self, key: &SequenceKey, code: &str) -> Result<bool, PersistenceError> {
            self.inner.release_code(key, code).await
        }
    }

    #[tokio::test]
    async fn test_reset_over_a_period_started_elsewhere_never_duplicates() {
        let inner = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FixedClock::new(utc(2025, 1, 15)));
        let k = key("logistics", "shipment");

        let first = SequenceService::new(inner.clone(), settings()).with_clock(clock.clone());
        assert_eq!(first.generate(&k).await.unwrap(), "SHP-20250115-001");

        let interleaved = Arc::new(InterleavedRegistry {
            inner: inner.clone(),
            rival: SequenceService::new(inner.clone(), settings()).with_clock(clock.clone()),
            rival_codes: std::sync::Mutex::new(Vec::new()),
        });
        let second = SequenceService::new(interleaved.clone(), settings()).with_clock(clock.clone());

        clock.set(utc(2025, 1, 16));
        let own = second.generate(&k).await.unwrap();
        let rival = interleaved.rival_codes.lock().unwrap().clone();

        assert_eq!(rival, vec!["SHP-20250116-001".to_string()]);
        assert_eq!(own, "SHP-20250116-002");
        let state = inner.get_state(&k).await.unwrap();
        assert_eq!(state.current_number, 2);
        assert!(state.used_codes.contains("SHP-20250116-001"));
        assert!(state.used_codes.contains("SHP-20250116-002"));
    }

    /// Хранилище, в котором любая операция падает
    struct BrokenRegistry;

    fn broken<T>() -> Result<T, PersistenceError> {
        Err(PersistenceError::LockPoisoned("storage offline".into()))
    }

    #[async_trait]
    impl SequenceRegistry for BrokenRegistry {
        async fn get_config(&self, _: &SequenceKey) -> Result<Option<SequenceConfig>, PersistenceError> {
            broken()
        }
        async fn put_config(&self, _: &SequenceConfig) -> Result<(), PersistenceError> {
            broken()
        }
        async fn delete_config(&self, _: &SequenceKey) -> Result<bool, PersistenceError> {
            broken()
        }
        async fn list_configs(&self, _: Option<&str>) -> Result<Vec<SequenceConfig>, PersistenceError> {
            broken()
        }
        async fn get_state(&self, _: &SequenceKey) -> Result<SequenceState, PersistenceError> {
            broken()
        }
        async fn get_counter(&self, _: &SequenceKey) -> Result<Counter, PersistenceError> {
            broken()
        }
        async fn put_state(&self, _: &SequenceKey, _: &SequenceState) -> Result<(), PersistenceError> {
            broken()
        }
        async fn delete_state(&self, _: &SequenceKey) -> Result<bool, PersistenceError> {
            broken()
        }
        async fn compare_and_set_counter(&self, _: &SequenceKey, _: Counter, _: i64) -> Result<bool, PersistenceError> {
            broken()
        }
        async fn reset_period(&self, _: &SequenceKey, _: Counter, _: DateTime<Utc>) -> Result<bool, PersistenceError> {
            broken()
        }
        async fn start_period(&self, _: &SequenceKey, _: DateTime<Utc>) -> Result<bool, PersistenceError> {
            broken()
        }
        async fn claim_code(&self, _: &SequenceKey, _: &str) -> Result<bool, PersistenceError> {
            broken()
        }
        async fn release_code(&self, _: &SequenceKey, _: &str) -> Result<bool, PersistenceError> {
            broken()
        }
    }

    #[tokio::test]
    async fn test_storage_failure_propagates_or_degrades_visibly() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 15).unwrap(),
        ));
        let service = SequenceService::new(
            Arc::new(BrokenRegistry),
            NumberingConfig {
                utc_offset_hours: 0,
                ..settings()
            },
        )
        .with_clock(clock);
        let k = key("sales", "invoice");

        assert!(matches!(
            service.generate(&k).await,
            Err(NumberingError::Persistence(_))
        ));

        let issued = service.generate_or_degraded(&k).await.unwrap();
        assert!(issued.degraded);
        assert_eq!(issued.code, "INVOICE-TMP-20250115093015000");
    }

    #[tokio::test]
    async fn test_degraded_path_not_used_for_other_errors() {
        let (service, _, _) = service_at(utc(2025, 1, 15));
        let k = key("sales", "invoice");
        service
            .update_config(
                &k,
                SequenceConfigPatch {
                    enabled: Some(false),
                    ..patch()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            service.generate_or_degraded(&k).await,
            Err(NumberingError::Disabled(_))
        ));

        let (healthy, _, _) = service_at(utc(2025, 1, 15));
        let issued = healthy.generate_or_degraded(&k).await.unwrap();
        assert_eq!(issued, IssuedNumber::regular("INV-2025-0001".into()));
    }
}
