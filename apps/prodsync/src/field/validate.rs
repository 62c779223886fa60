use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

/// How a field's text is interpreted before it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueKind {
    #[default]
    Text,
    Integer,
    Decimal,
    Date,
    Time,
    DateTime,
    Boolean,
}

impl ValueKind {
    /// Maps the server's type names; anything unrecognized is free text.
    pub fn from_type_name(name: Option<&str>) -> Self {
        let Some(name) = name else {
            return ValueKind::Text;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" | "number_int" => ValueKind::Integer,
            "decimal" | "number" | "float" | "double" => ValueKind::Decimal,
            "date" => ValueKind::Date,
            "time" => ValueKind::Time,
            "datetime" | "date_time" | "timestamp" => ValueKind::DateTime,
            "boolean" | "bool" | "checkbox" => ValueKind::Boolean,
            _ => ValueKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("'{0}' is not a whole number")]
    NotInteger(String),
    #[error("'{0}' is not a number")]
    NotDecimal(String),
    #[error("'{0}' is not a valid date")]
    InvalidDate(String),
    #[error("'{0}' is not a valid time")]
    InvalidTime(String),
    #[error("'{0}' is not a valid date and time")]
    InvalidDateTime(String),
    #[error("'{0}' is not yes or no")]
    InvalidBoolean(String),
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Normalizes raw input into the wire value. Blank input clears the answer.
/// Time-only values are pinned to `today`; a Time value that already carries
/// a date keeps it.
pub fn normalize(kind: ValueKind, raw: &str, today: NaiveDate) -> Result<Option<String>, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value = match kind {
        ValueKind::Text => raw.to_string(),
        ValueKind::Integer => trimmed
            .parse::<i64>()
            .map(|n| n.to_string())
            .map_err(|_| ValidationError::NotInteger(trimmed.to_string()))?,
        ValueKind::Decimal => {
            let candidate = trimmed.replace(',', ".");
            match candidate.parse::<f64>() {
                Ok(n) if n.is_finite() => candidate,
                _ => return Err(ValidationError::NotDecimal(trimmed.to_string())),
            }
        }
        ValueKind::Date => parse_date(trimmed)
            .map(|date| date.format(DATE_FORMAT).to_string())
            .ok_or_else(|| ValidationError::InvalidDate(trimmed.to_string()))?,
        ValueKind::Time => parse_time(trimmed)
            .map(|time| today.and_time(time))
            .or_else(|| parse_date_time(trimmed))
            .map(|moment| moment.format(DATE_TIME_FORMAT).to_string())
            .ok_or_else(|| ValidationError::InvalidTime(trimmed.to_string()))?,
        ValueKind::DateTime => parse_date_time(trimmed)
            .map(|moment| moment.format(DATE_TIME_FORMAT).to_string())
            .ok_or_else(|| ValidationError::InvalidDateTime(trimmed.to_string()))?,
        ValueKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => "true".to_string(),
            "false" | "no" | "n" | "0" => "false".to_string(),
            _ => return Err(ValidationError::InvalidBoolean(trimmed.to_string())),
        },
    };
    Ok(Some(value))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(raw, format).ok())
}

fn parse_date_time(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(moment) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(moment.naive_local());
    }
    [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ]
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn blank_clears() {
        assert_eq!(normalize(ValueKind::Integer, "   ", today()), Ok(None));
        assert_eq!(normalize(ValueKind::Text, "", today()), Ok(None));
    }

    #[test]
    fn numbers() {
        assert_eq!(
            normalize(ValueKind::Integer, " 12 ", today()),
            Ok(Some("12".into()))
        );
        assert_eq!(
            normalize(ValueKind::Integer, "4.5", today()),
            Err(ValidationError::NotInteger("4.5".into()))
        );
        assert_eq!(
            normalize(ValueKind::Decimal, "4,5", today()),
            Ok(Some("4.5".into()))
        );
        assert!(normalize(ValueKind::Decimal, "abc", today()).is_err());
        assert!(normalize(ValueKind::Decimal, "NaN", today()).is_err());
    }

    #[test]
    fn dates_and_times() {
        assert_eq!(
            normalize(ValueKind::Date, "01/05/2024", today()),
            Ok(Some("2024-05-01".into()))
        );
        assert_eq!(
            normalize(ValueKind::Time, "14:30", today()),
            Ok(Some("2024-05-01T14:30:00".into()))
        );
        assert_eq!(
            normalize(ValueKind::DateTime, "2024-05-01 08:15", today()),
            Ok(Some("2024-05-01T08:15:00".into()))
        );
        assert!(normalize(ValueKind::Time, "25:00", today()).is_err());
    }

    #[test]
    fn time_accepts_its_own_wire_format() {
        let saved = normalize(ValueKind::Time, "08:30", today()).unwrap().unwrap();
        assert_eq!(
            normalize(ValueKind::Time, &saved, today()),
            Ok(Some(saved.clone()))
        );
        // A stored value from another day is not moved to today.
        assert_eq!(
            normalize(ValueKind::Time, "2024-04-30T08:30:00", today()),
            Ok(Some("2024-04-30T08:30:00".into()))
        );
        assert_eq!(
            normalize(ValueKind::Time, "2024-04-30T08:30:00+02:00", today()),
            Ok(Some("2024-04-30T08:30:00".into()))
        );
        assert!(normalize(ValueKind::Time, "2024-04-30T25:00:00", today()).is_err());
    }

    #[test]
    fn booleans_and_type_names() {
        assert_eq!(
            normalize(ValueKind::Boolean, "Yes", today()),
            Ok(Some("true".into()))
        );
        assert!(normalize(ValueKind::Boolean, "maybe", today()).is_err());
        assert_eq!(ValueKind::from_type_name(Some("DECIMAL")), ValueKind::Decimal);
        assert_eq!(ValueKind::from_type_name(Some("signature")), ValueKind::Text);
        assert_eq!(ValueKind::from_type_name(None), ValueKind::Text);
    }
}
