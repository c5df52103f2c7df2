use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Key
// ============================================================================

/// Ключ нумератора: домен + имя последовательности.
///
/// `invoice` в домене `sales` и `invoice` в любом другом домене это разные
/// последовательности, поэтому ключи хранилища всегда содержат домен.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceKey {
    pub domain: String,
    pub name: String,
}

impl SequenceKey {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Result<Self, String> {
        let key = Self {
            domain: domain.into().trim().to_string(),
            name: name.into().trim().to_string(),
        };
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<(), String> {
        fn check(part: &str, what: &str) -> Result<(), String> {
            if part.is_empty() {
                return Err(format!("{} must not be empty", what));
            }
            let ok = part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
            if !ok {
                return Err(format!(
                    "{} '{}' may contain only a-z, 0-9, '_' and '-'",
                    what, part
                ));
            }
            Ok(())
        }
        check(&self.domain, "Domain")?;
        check(&self.name, "Sequence key")
    }

    /// `sales:sequence:config:invoice`
    pub fn config_storage_key(&self) -> String {
        format!("{}:sequence:config:{}", self.domain, self.name)
    }

    /// `sales:sequence:state:invoice`
    pub fn state_storage_key(&self) -> String {
        format!("{}:sequence:state:{}", self.domain, self.name)
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.name)
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Периодичность сброса счетчика
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetFrequency {
    #[default]
    Never,
    Daily,
    Monthly,
    Yearly,
}

impl ResetFrequency {
    pub fn code(&self) -> &'static str {
        match self {
            ResetFrequency::Never => "never",
            ResetFrequency::Daily => "daily",
            ResetFrequency::Monthly => "monthly",
            ResetFrequency::Yearly => "yearly",
        }
    }

    pub fn all() -> Vec<ResetFrequency> {
        vec![
            ResetFrequency::Never,
            ResetFrequency::Daily,
            ResetFrequency::Monthly,
            ResetFrequency::Yearly,
        ]
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "never" => Some(ResetFrequency::Never),
            "daily" => Some(ResetFrequency::Daily),
            "monthly" => Some(ResetFrequency::Monthly),
            "yearly" => Some(ResetFrequency::Yearly),
            _ => None,
        }
    }
}

impl fmt::Display for ResetFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Порядок частей номера, когда шаблон не задан
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NumberFormat {
    #[default]
    PrefixNumber,
    NumberSuffix,
    PrefixNumberSuffix,
}

impl NumberFormat {
    pub fn code(&self) -> &'static str {
        match self {
            NumberFormat::PrefixNumber => "prefix-number",
            NumberFormat::NumberSuffix => "number-suffix",
            NumberFormat::PrefixNumberSuffix => "prefix-number-suffix",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "prefix-number" => Some(NumberFormat::PrefixNumber),
            "number-suffix" => Some(NumberFormat::NumberSuffix),
            "prefix-number-suffix" => Some(NumberFormat::PrefixNumberSuffix),
            _ => None,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

pub const MAX_NUMBER_LENGTH: u32 = 18;

/// Настройки одной последовательности номеров
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceConfig {
    pub key: SequenceKey,
    pub prefix: String,
    pub suffix: Option<String>,
    /// `{prefix}`, `{suffix}`, `{year}`, `{month}`, `{day}`, `{number}`, `{number:0000}`
    pub template: Option<String>,
    pub format: NumberFormat,
    pub number_length: u32,
    pub separator: String,
    pub start_from: i64,
    pub increment: i64,
    pub reset_frequency: ResetFrequency,
    pub include_check_digit: bool,
    pub enabled: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SequenceConfig {
    /// Настройки "по умолчанию" без шаблона: `PREFIX-0001`
    pub fn new(key: SequenceKey, prefix: impl Into<String>) -> Self {
        Self {
            key,
            prefix: prefix.into(),
            suffix: None,
            template: None,
            format: NumberFormat::PrefixNumber,
            number_length: 4,
            separator: "-".into(),
            start_from: 1,
            increment: 1,
            reset_frequency: ResetFrequency::Never,
            include_check_digit: false,
            enabled: true,
            updated_at: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_reset(mut self, reset_frequency: ResetFrequency) -> Self {
        self.reset_frequency = reset_frequency;
        self
    }

    /// Шаблон, если он задан и не пустой
    pub fn effective_template(&self) -> Option<&str> {
        self.template.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Значение счетчика, которое будет выдано после `current`
    pub fn next_counter(&self, current: i64) -> i64 {
        current.saturating_add(self.increment).max(self.start_from)
    }

    /// Проверка числовых полей. Шаблон проверяется на стороне backend.
    pub fn validate(&self) -> Result<(), String> {
        self.key.validate()?;
        if self.number_length == 0 {
            return Err("numberLength must be positive".into());
        }
        if self.number_length > MAX_NUMBER_LENGTH {
            return Err(format!("numberLength must not exceed {}", MAX_NUMBER_LENGTH));
        }
        if self.increment < 1 {
            return Err("increment must be at least 1".into());
        }
        if self.start_from < 0 {
            return Err("startFrom must not be negative".into());
        }
        if self.effective_template().is_none() && self.prefix.is_empty() && self.suffix.is_none()
        {
            return Err("prefix, suffix or template is required".into());
        }
        Ok(())
    }
}

// ============================================================================
// State
// ============================================================================

/// Изменяемое состояние последовательности
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceState {
    pub current_number: i64,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub used_codes: BTreeSet<String>,
}

impl SequenceState {
    pub fn is_fresh(&self) -> bool {
        self.current_number == 0 && self.last_reset_at.is_none() && self.used_codes.is_empty()
    }
}
