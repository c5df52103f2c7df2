use contracts::system::sys_numbering::SequenceConfig;
use regex::Regex;

use super::error::{NumberingError, NumberingResult};
use super::formatter::luhn_is_valid;
use super::template::{self, Segment};

/// Регулярное выражение, которому соответствует любой номер данной последовательности
pub fn code_pattern(config: &SequenceConfig) -> NumberingResult<Regex> {
    let segments = template::layout(config).map_err(NumberingError::Configuration)?;

    let mut pattern = String::from("^");
    for segment in &segments {
        match segment {
            Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
            Segment::Prefix => pattern.push_str(&regex::escape(&config.prefix)),
            Segment::Suffix => {
                pattern.push_str(&regex::escape(config.suffix.as_deref().unwrap_or_default()))
            }
            Segment::Year => pattern.push_str(r"\d{4}"),
            Segment::Month => pattern.push_str(r"(0[1-9]|1[0-2])"),
            Segment::Day => pattern.push_str(r"(0[1-9]|[12]\d|3[01])"),
            Segment::Number(width) => {
                let width = width.unwrap_or(config.number_length as usize);
                pattern.push_str(&format!(r"\d{{{},}}", width));
            }
        }
    }
    if config.include_check_digit {
        pattern.push_str(r"\d");
    }
    pattern.push('$');

    Regex::new(&pattern)
        .map_err(|e| NumberingError::config(format!("Cannot build code pattern: {}", e)))
}

/// Структурная проверка номера (плюс контрольная цифра, если она включена)
pub fn is_valid_code(config: &SequenceConfig, code: &str) -> NumberingResult<bool> {
    let pattern = code_pattern(config)?;
    if !pattern.is_match(code) {
        return Ok(false);
    }
    Ok(!config.include_check_digit || luhn_is_valid(code))
}
