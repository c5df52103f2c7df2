//! Разбор шаблона номера в последовательность сегментов.
//!
//! Шаблон разбирается за один проход, подставленные значения повторно не
//! сканируются: `{number}` внутри префикса остается обычным текстом.

use contracts::system::sys_numbering::aggregate::MAX_NUMBER_LENGTH;
use contracts::system::sys_numbering::{NumberFormat, SequenceConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Prefix,
    Suffix,
    Year,
    Month,
    Day,
    /// `Some(width)` для `{number:000}`, `None` для `{number}` (ширина из numberLength)
    Number(Option<usize>),
}

pub fn parse(template: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        literal.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("Unterminated placeholder in template '{}'", template))?;
        let name = &after[..close];

        let segment = placeholder(name)
            .ok_or_else(|| format!("Unknown placeholder '{{{}}}' in template '{}'", name, template))?;
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(segment);
        rest = &after[close + 1..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    if !segments.iter().any(|s| matches!(s, Segment::Number(_))) {
        return Err(format!(
            "Template '{}' has no {{number}} placeholder",
            template
        ));
    }
    Ok(segments)
}

fn placeholder(name: &str) -> Option<Segment> {
    match name {
        "prefix" => Some(Segment::Prefix),
        "suffix" => Some(Segment::Suffix),
        "year" => Some(Segment::Year),
        "month" => Some(Segment::Month),
        "day" => Some(Segment::Day),
        "number" => Some(Segment::Number(None)),
        _ => {
            let zeros = name.strip_prefix("number:")?;
            let width = zeros.len();
            let valid = width > 0
                && width <= MAX_NUMBER_LENGTH as usize
                && zeros.chars().all(|c| c == '0');
            valid.then_some(Segment::Number(Some(width)))
        }
    }
}

/// Сегменты номера для настроек: шаблон, если он задан, иначе сборка по `format`
pub fn layout(config: &SequenceConfig) -> Result<Vec<Segment>, String> {
    if let Some(template) = config.effective_template() {
        return parse(template);
    }

    let has_prefix = !config.prefix.is_empty();
    let has_suffix = config.suffix.as_deref().is_some_and(|s| !s.is_empty());
    let mut parts = Vec::new();
    match config.format {
        NumberFormat::PrefixNumber => {
            if has_prefix {
                parts.push(Segment::Prefix);
            }
            parts.push(Segment::Number(None));
        }
        NumberFormat::NumberSuffix => {
            parts.push(Segment::Number(None));
            if has_suffix {
                parts.push(Segment::Suffix);
            }
        }
        NumberFormat::PrefixNumberSuffix => {
            if has_prefix {
                parts.push(Segment::Prefix);
            }
            parts.push(Segment::Number(None));
            if has_suffix {
                parts.push(Segment::Suffix);
            }
        }
    }

    if config.separator.is_empty() {
        return Ok(parts);
    }
    let mut segments = Vec::with_capacity(parts.len() * 2);
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            segments.push(Segment::Literal(config.separator.clone()));
        }
        segments.push(part);
    }
    Ok(segments)
}
