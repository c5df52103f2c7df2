use chrono::{DateTime, Datelike, FixedOffset};
use contracts::system::sys_numbering::SequenceConfig;

use super::error::{NumberingError, NumberingResult};
use super::template::{self, Segment};

/// Форматирует значение счетчика в номер документа.
///
/// Чистая функция: одинаковые `(config, counter, now)` всегда дают одинаковую строку.
/// Счетчик шире заданной ширины выводится целиком.
pub fn format_code(
    config: &SequenceConfig,
    counter: i64,
    now: DateTime<FixedOffset>,
) -> NumberingResult<String> {
    let segments = template::layout(config).map_err(NumberingError::Configuration)?;
    let mut code = render(&segments, config, counter, now);
    if config.include_check_digit {
        code.push(char::from(b'0' + luhn_check_digit(&code)));
    }
    Ok(code)
}

fn render(
    segments: &[Segment],
    config: &SequenceConfig,
    counter: i64,
    now: DateTime<FixedOffset>,
) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Prefix => out.push_str(&config.prefix),
            Segment::Suffix => out.push_str(config.suffix.as_deref().unwrap_or_default()),
            Segment::Year => out.push_str(&format!("{:04}", now.year())),
            Segment::Month => out.push_str(&format!("{:02}", now.month())),
            Segment::Day => out.push_str(&format!("{:02}", now.day())),
            Segment::Number(width) => {
                let width = width.unwrap_or(config.number_length as usize);
                out.push_str(&format!("{:0width$}", counter, width = width));
            }
        }
    }
    out
}

/// Контрольная цифра Луна по всем цифрам строки (остальные символы пропускаются)
pub fn luhn_check_digit(payload: &str) -> u8 {
    let sum = luhn_sum(payload, true);
    ((10 - sum % 10) % 10) as u8
}

/// Проверка строки, последняя цифра которой является контрольной
pub fn luhn_is_valid(code: &str) -> bool {
    code.chars().any(|c| c.is_ascii_digit()) && luhn_sum(code, false) % 10 == 0
}

fn luhn_sum(text: &str, double_first: bool) -> u32 {
    text.chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| {
            let doubled = (i % 2 == 0) == double_first;
            if doubled {
                let d = d * 2;
                if d > 9 {
                    d - 9
                } else {
                    d
                }
            } else {
                d
            }
        })
        .sum()
}
