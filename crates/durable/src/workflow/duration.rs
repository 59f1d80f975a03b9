//! Human-readable relative spans for `sleep` ("250ms", "5s", "1h30m")

use std::time::Duration;

/// Error returned when a span string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpanError {
    #[error("empty duration span")]
    Empty,

    #[error("missing number before unit in span {0:?}")]
    MissingNumber(String),

    #[error("missing unit after number in span {0:?}")]
    MissingUnit(String),

    #[error("unknown duration unit {unit:?} in span {span:?}")]
    UnknownUnit { span: String, unit: String },

    #[error("duration span {0:?} overflows")]
    Overflow(String),
}

/// Parse a relative span such as `"5s"`, `"100ms"`, `"2 minutes"` or `"1h30m"`.
///
/// Units: `ms`, `s`, `m`, `h`, `d` and their long forms. Components are
/// summed, whitespace between them is ignored.
pub fn parse_span(span: &str) -> Result<Duration, SpanError> {
    let trimmed = span.trim();
    if trimmed.is_empty() {
        return Err(SpanError::Empty);
    }

    let mut total = Duration::ZERO;
    let mut chars = trimmed.chars().peekable();

    while chars.peek().is_some() {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            number.push(c);
            chars.next();
        }
        if number.is_empty() {
            return Err(SpanError::MissingNumber(span.to_string()));
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }
        if unit.is_empty() {
            return Err(SpanError::MissingUnit(span.to_string()));
        }

        let value: u64 = number
            .parse()
            .map_err(|_| SpanError::Overflow(span.to_string()))?;
        let millis_per_unit = unit_millis(&unit).ok_or_else(|| SpanError::UnknownUnit {
            span: span.to_string(),
            unit: unit.clone(),
        })?;
        let millis = value
            .checked_mul(millis_per_unit)
            .ok_or_else(|| SpanError::Overflow(span.to_string()))?;

        total = total
            .checked_add(Duration::from_millis(millis))
            .ok_or_else(|| SpanError::Overflow(span.to_string()))?;
    }

    Ok(total)
}

fn unit_millis(unit: &str) -> Option<u64> {
    let millis = match unit {
        "ms" | "msec" | "msecs" | "millis" | "millisecond" | "milliseconds" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        _ => return None,
    };
    Some(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_units() {
        assert_eq!(parse_span("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_span("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_span("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_span("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_span("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_long_forms_and_whitespace() {
        assert_eq!(parse_span(" 5 seconds ").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_span("3 Minutes").unwrap(), Duration::from_secs(180));
    }

    #[test]
    fn test_compound_span() {
        assert_eq!(parse_span("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_span("1m 500ms").unwrap(),
            Duration::from_millis(60_500)
        );
    }

    #[test]
    fn test_invalid_spans() {
        assert_eq!(parse_span(""), Err(SpanError::Empty));
        assert!(matches!(parse_span("5"), Err(SpanError::MissingUnit(_))));
        assert!(matches!(parse_span("s"), Err(SpanError::MissingNumber(_))));
        assert!(matches!(
            parse_span("5 fortnights"),
            Err(SpanError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_span("99999999999999999999d"),
            Err(SpanError::Overflow(_))
        ));
    }
}
