//! Per-field type checks and coercion

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use sqlx::types::BigDecimal;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::catalog::{FieldSpec, FieldType, TableSpec};

static PLAIN_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+(\.\d+)?$").unwrap_or_else(|_| unreachable!()));

static DAY_MONTH_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,2}[/.-]\d{1,2}[/.-]\d{2,4}$").unwrap_or_else(|_| unreachable!())
});

const CURRENCY_SYMBOLS: [char; 4] = ['$', '€', '£', '¥'];

/// A validated, typed cell. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(Option<String>),
    Numeric(Option<BigDecimal>),
    Date(Option<NaiveDate>),
    Boolean(Option<bool>),
}

impl FieldValue {
    fn null(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Text | FieldType::Enum => FieldValue::Text(None),
            FieldType::Numeric => FieldValue::Numeric(None),
            FieldType::Date => FieldValue::Date(None),
            FieldType::Boolean => FieldValue::Boolean(None),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Text(v) => v.is_none(),
            FieldValue::Numeric(v) => v.is_none(),
            FieldValue::Date(v) => v.is_none(),
            FieldValue::Boolean(v) => v.is_none(),
        }
    }

    /// Canonical text used in composite keys. Matches what Postgres
    /// renders for the column cast to text, so in-file and in-store
    /// keys compare equal.
    pub fn key_text(&self) -> Option<String> {
        let text = match self {
            FieldValue::Text(v) => v.as_deref().map(|s| s.trim().to_string()),
            FieldValue::Numeric(v) => v.as_ref().map(canonical_decimal),
            FieldValue::Date(v) => v.map(|d| d.format("%Y-%m-%d").to_string()),
            FieldValue::Boolean(v) => v.map(|b| b.to_string()),
        };
        text.filter(|t| !t.is_empty())
    }
}

/// Plain decimal text without trailing fractional zeros, the way Postgres
/// prints `trim_scale(n)`: `10.50` and `10.5` both give `10.5`.
fn canonical_decimal(value: &BigDecimal) -> String {
    let (digits, scale) = value.as_bigint_and_exponent();
    let digits = digits.to_string();
    let (sign, magnitude) = match digits.strip_prefix('-') {
        Some(magnitude) => ("-", magnitude),
        None => ("", digits.as_str()),
    };

    let plain = match usize::try_from(scale) {
        Ok(0) => magnitude.to_string(),
        Ok(scale) => {
            let padded = format!("{magnitude:0>width$}", width = scale + 1);
            let (whole, fraction) = padded.split_at(padded.len() - scale);
            match fraction.trim_end_matches('0') {
                "" => whole.to_string(),
                fraction => format!("{whole}.{fraction}"),
            }
        }
        Err(_) => {
            let zeros = usize::try_from(scale.unsigned_abs()).unwrap_or(0);
            format!("{magnitude}{}", "0".repeat(zeros))
        }
    };

    if plain.bytes().all(|b| b == b'0') {
        "0".to_string()
    } else {
        format!("{sign}{plain}")
    }
}

/// A row that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanRow {
    pub line: u64,
    /// One value per table field, in field order
    pub values: Vec<FieldValue>,
    /// Source fields as received
    pub raw: Vec<String>,
}

/// Validate the mapped values of one record against the table, giving
/// one typed value per field.
///
/// All field errors are collected and joined with `"; "`.
pub fn validate_row(table: &TableSpec, mapped: &[String]) -> Result<Vec<FieldValue>, String> {
    let mut values = Vec::with_capacity(table.fields.len());
    let mut errors = Vec::new();

    for (index, field) in table.fields.iter().enumerate() {
        let input = mapped.get(index).map(String::as_str).unwrap_or("");
        match validate_field(field, input) {
            Ok(value) => values.push(value),
            Err(message) => errors.push(format!("{}: {}", field.name, message)),
        }
    }

    if errors.is_empty() {
        Ok(values)
    } else {
        Err(errors.join("; "))
    }
}

pub fn validate_field(field: &FieldSpec, input: &str) -> Result<FieldValue, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        if field.required {
            return Err("value is required".to_string());
        }
        if !field.allow_empty {
            return Err("empty value not allowed".to_string());
        }
        return Ok(FieldValue::null(field.field_type));
    }

    match field.field_type {
        FieldType::Text => Ok(FieldValue::Text(Some(input.to_string()))),
        FieldType::Numeric => parse_numeric(trimmed).map(|d| FieldValue::Numeric(Some(d))),
        FieldType::Date => parse_date(trimmed).map(|d| FieldValue::Date(Some(d))),
        FieldType::Boolean => parse_boolean(trimmed).map(|b| FieldValue::Boolean(Some(b))),
        FieldType::Enum => {
            if field.enum_values.iter().any(|allowed| allowed == trimmed) {
                Ok(FieldValue::Text(Some(trimmed.to_string())))
            } else {
                Err(format!(
                    "'{}' is not one of [{}]",
                    trimmed,
                    field.enum_values.join(", ")
                ))
            }
        }
    }
}

/// Parse a human-formatted decimal: `"$1,234.56"`, `"(42)"`, `"1 000"`.
pub fn parse_numeric(input: &str) -> Result<BigDecimal, String> {
    let mut cleaned: String = input
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',' && *c != '_' && !c.is_whitespace())
        .collect();

    let parenthesized = cleaned.len() >= 2 && cleaned.starts_with('(') && cleaned.ends_with(')');
    if parenthesized {
        cleaned = cleaned[1..cleaned.len() - 1].to_string();
        if cleaned.starts_with(['+', '-']) {
            return Err(format!("'{}' is not a number", input));
        }
    }

    if !PLAIN_DECIMAL.is_match(&cleaned) {
        return Err(format!("'{}' is not a number", input));
    }

    let unsigned = cleaned.trim_start_matches('+');
    let normalized = if parenthesized {
        format!("-{}", unsigned)
    } else {
        unsigned.to_string()
    };

    BigDecimal::from_str(&normalized).map_err(|_| format!("'{}' is not a number", input))
}

/// Parse an unambiguous date; the time part of timestamps is dropped.
pub fn parse_date(input: &str) -> Result<NaiveDate, String> {
    if DAY_MONTH_FIRST.is_match(input) {
        return Err(format!("'{}' is ambiguous, use YYYY-MM-DD", input));
    }

    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return Ok(date);
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(timestamp.date());
        }
    }
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(input) {
        return Ok(timestamp.date_naive());
    }

    Err(format!("'{}' is not a valid date", input))
}

pub fn parse_boolean(input: &str) -> Result<bool, String> {
    match input.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(format!("'{}' is not a boolean", input)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn decimal(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_numeric_formats() {
        assert_eq!(parse_numeric("$1,234.56").unwrap(), decimal("1234.56"));
        assert_eq!(parse_numeric("(1,000)").unwrap(), decimal("-1000"));
        assert_eq!(parse_numeric("€ 12 500").unwrap(), decimal("12500"));
        assert_eq!(parse_numeric("1_000.5").unwrap(), decimal("1000.5"));
        assert_eq!(parse_numeric("+7").unwrap(), decimal("7"));
        assert_eq!(parse_numeric("-0.25").unwrap(), decimal("-0.25"));
    }

    #[test]
    fn test_numeric_rejects_garbage() {
        assert!(parse_numeric("12abc").is_err());
        assert!(parse_numeric("1.2.3").is_err());
        assert!(parse_numeric("(-5)").is_err());
        assert!(parse_numeric("$").is_err());
    }

    #[test]
    fn test_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(parse_date("2024-03-09").unwrap(), expected);
        assert_eq!(parse_date("2024/03/09").unwrap(), expected);
        assert_eq!(parse_date("2024-03-09T17:45:00").unwrap(), expected);
        assert_eq!(parse_date("2024-03-09T23:30:00+02:00").unwrap(), expected);
    }

    #[test]
    fn test_date_rejects_ambiguous_and_invalid() {
        assert!(parse_date("01/02/2024").unwrap_err().contains("ambiguous"));
        assert!(parse_date("3-9-24").unwrap_err().contains("ambiguous"));
        assert!(parse_date("2024-02-30").is_err());
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_boolean() {
        assert!(parse_boolean("YES").unwrap());
        assert!(parse_boolean("1").unwrap());
        assert!(!parse_boolean("False").unwrap());
        assert!(parse_boolean("maybe").is_err());
    }

    #[test]
    fn test_empty_values() {
        let required = FieldSpec::new("email", FieldType::Text).required();
        assert_eq!(validate_field(&required, "  ").unwrap_err(), "value is required");

        let strict = FieldSpec::new("code", FieldType::Text).not_empty();
        assert_eq!(validate_field(&strict, "").unwrap_err(), "empty value not allowed");

        let optional = FieldSpec::new("joined", FieldType::Date);
        assert_eq!(validate_field(&optional, "").unwrap(), FieldValue::Date(None));
    }

    #[test]
    fn test_enum_is_case_sensitive() {
        let field = FieldSpec::new("tier", FieldType::Enum).with_enum_values(["free", "pro"]);
        assert_eq!(
            validate_field(&field, "pro").unwrap(),
            FieldValue::Text(Some("pro".into()))
        );
        assert!(validate_field(&field, "Pro").is_err());
    }

    #[test]
    fn test_text_is_passed_through_untrimmed() {
        let field = FieldSpec::new("note", FieldType::Text);
        assert_eq!(
            validate_field(&field, " hi ").unwrap(),
            FieldValue::Text(Some(" hi ".into()))
        );
    }

    #[test]
    fn test_row_errors_are_joined() {
        let table = TableSpec::new("people", "people")
            .field(FieldSpec::new("email", FieldType::Text).required())
            .field(FieldSpec::new("age", FieldType::Numeric))
            .field(FieldSpec::new("active", FieldType::Boolean));

        let mapped = vec!["".to_string(), "ten".to_string(), "yes".to_string()];
        let err = validate_row(&table, &mapped).unwrap_err();
        assert_eq!(err, "email: value is required; age: 'ten' is not a number");

        let mapped = vec!["a@b.c".to_string(), "10".to_string(), "no".to_string()];
        let values = validate_row(&table, &mapped).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[2], FieldValue::Boolean(Some(false)));
    }

    #[test]
    fn test_key_text_is_canonical() {
        assert_eq!(
            FieldValue::Text(Some("  a@b.c ".into())).key_text().as_deref(),
            Some("a@b.c")
        );
        assert_eq!(
            FieldValue::Numeric(Some(decimal("1234.56"))).key_text().as_deref(),
            Some("1234.56")
        );
        assert_eq!(
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 2)).key_text().as_deref(),
            Some("2024-01-02")
        );
        assert_eq!(FieldValue::Boolean(None).key_text(), None);
    }

    #[test]
    fn test_numeric_key_ignores_scale() {
        let key = |s: &str| FieldValue::Numeric(Some(decimal(s))).key_text().unwrap();

        assert_eq!(key("10.50"), "10.5");
        assert_eq!(key("10.5"), key("10.500"));
        assert_eq!(key("7.00"), "7");
        assert_eq!(key("100"), "100");
        assert_eq!(key("0.050"), "0.05");
        assert_eq!(key("-3.10"), "-3.1");
        assert_eq!(key("-0.00"), "0");

        let parsed = FieldValue::Numeric(Some(parse_numeric("$1,200.00").unwrap()));
        assert_eq!(parsed.key_text().as_deref(), Some("1200"));
    }
}
