use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregate::{NumberFormat, ResetFrequency, SequenceConfig, SequenceKey, SequenceState};

/// Частичное изменение настроек нумератора.
///
/// Для `suffix` и `template` пустая строка означает "очистить".
/// Коды перечислений передаются строками и проверяются на сервере.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceConfigPatch {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub template: Option<String>,
    pub format: Option<String>,
    pub number_length: Option<u32>,
    pub separator: Option<String>,
    pub start_from: Option<i64>,
    pub increment: Option<i64>,
    pub reset_frequency: Option<String>,
    pub include_check_digit: Option<bool>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

/// Выданный номер.
///
/// `degraded = true` означает аварийный номер на основе времени: он не
/// учитывается в наборе выданных кодов и должен быть заменен позже.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedNumber {
    pub code: String,
    pub degraded: bool,
}

impl IssuedNumber {
    pub fn regular(code: String) -> Self {
        Self {
            code,
            degraded: false,
        }
    }

    pub fn degraded(code: String) -> Self {
        Self {
            code,
            degraded: true,
        }
    }
}

/// Настройки внутри снимка.
///
/// Те же поля, что у `SequenceConfig`, но `format` и `resetFrequency`
/// приходят строками и проверяются при импорте, как в `SequenceConfigPatch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    pub key: SequenceKey,
    pub prefix: String,
    pub suffix: Option<String>,
    pub template: Option<String>,
    pub format: String,
    pub number_length: u32,
    pub separator: String,
    pub start_from: i64,
    pub increment: i64,
    pub reset_frequency: String,
    pub include_check_digit: bool,
    pub enabled: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<SequenceConfig> for SnapshotConfig {
    fn from(config: SequenceConfig) -> Self {
        Self {
            key: config.key,
            prefix: config.prefix,
            suffix: config.suffix,
            template: config.template,
            format: config.format.code().to_string(),
            number_length: config.number_length,
            separator: config.separator,
            start_from: config.start_from,
            increment: config.increment,
            reset_frequency: config.reset_frequency.code().to_string(),
            include_check_digit: config.include_check_digit,
            enabled: config.enabled,
            updated_at: config.updated_at,
        }
    }
}

impl TryFrom<SnapshotConfig> for SequenceConfig {
    type Error = String;

    fn try_from(c: SnapshotConfig) -> Result<Self, Self::Error> {
        let format = NumberFormat::from_code(&c.format)
            .ok_or_else(|| format!("Unknown format '{}'", c.format))?;
        let reset_frequency = ResetFrequency::from_code(&c.reset_frequency)
            .ok_or_else(|| format!("Unknown reset frequency '{}'", c.reset_frequency))?;
        Ok(SequenceConfig {
            key: c.key,
            prefix: c.prefix,
            suffix: c.suffix,
            template: c.template,
            format,
            number_length: c.number_length,
            separator: c.separator,
            start_from: c.start_from,
            increment: c.increment,
            reset_frequency,
            include_check_digit: c.include_check_digit,
            enabled: c.enabled,
            updated_at: c.updated_at,
        })
    }
}

/// Сериализованное состояние последовательности (экспорт/импорт)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSnapshot {
    pub key: SequenceKey,
    pub config: SnapshotConfig,
    pub current_number: i64,
    /// ISO-8601
    pub last_reset_at: Option<String>,
    pub used_codes: Vec<String>,
}

impl SequenceSnapshot {
    pub fn from_parts(config: SequenceConfig, state: SequenceState) -> Self {
        Self {
            key: config.key.clone(),
            current_number: state.current_number,
            last_reset_at: state.last_reset_at.map(|t| t.to_rfc3339()),
            used_codes: state.used_codes.into_iter().collect(),
            config: config.into(),
        }
    }

    pub fn into_parts(self) -> Result<(SequenceConfig, SequenceState), String> {
        self.key.validate()?;
        if self.key != self.config.key {
            return Err(format!(
                "Snapshot key {} does not match config key {}",
                self.key, self.config.key
            ));
        }
        if self.current_number < 0 {
            return Err("currentNumber must not be negative".into());
        }
        let last_reset_at = match self.last_reset_at {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| format!("Invalid lastResetAt '{}': {}", s, e))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        let state = SequenceState {
            current_number: self.current_number,
            last_reset_at,
            used_codes: self.used_codes.into_iter().collect(),
        };
        Ok((SequenceConfig::try_from(self.config)?, state))
    }
}
