//! Value-level rule evaluation.

use std::mem::discriminant;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde_json::Value;

use crate::model::annotated::value_to_string;
use crate::model::{ContentType, MatchingRule, RuleList, RuleLogic};

/// Check a value against a rule list, honouring its AND/OR logic.
pub(crate) fn check_rules(list: &RuleList, expected: &Value, actual: &Value) -> Result<(), String> {
    match list.logic {
        RuleLogic::And => list
            .rules
            .iter()
            .try_for_each(|rule| check_rule(rule, expected, actual)),
        RuleLogic::Or => {
            let mut failures = Vec::new();
            for rule in &list.rules {
                match check_rule(rule, expected, actual) {
                    Ok(()) => return Ok(()),
                    Err(msg) => failures.push(msg),
                }
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.join(", or "))
            }
        }
    }
}

/// Check a string (header, query, path, metadata) against a rule list.
pub(crate) fn check_str_rules(list: &RuleList, expected: &str, actual: &str) -> Result<(), String> {
    check_rules(
        list,
        &Value::String(expected.to_string()),
        &Value::String(actual.to_string()),
    )
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_type(expected: &Value, actual: &Value) -> Result<(), String> {
    if discriminant(expected) == discriminant(actual) {
        Ok(())
    } else {
        Err(format!(
            "Expected {} ({}) to be the same type as {} ({})",
            describe(actual),
            type_name(actual),
            describe(expected),
            type_name(expected)
        ))
    }
}

fn check_length(actual: &Value, min: Option<usize>, max: Option<usize>) -> Result<(), String> {
    let Value::Array(items) = actual else {
        return Ok(());
    };
    if let Some(min) = min {
        if items.len() < min {
            return Err(format!(
                "Expected {} to have at least {min} item(s)",
                describe(actual)
            ));
        }
    }
    if let Some(max) = max {
        if items.len() > max {
            return Err(format!(
                "Expected {} to have at most {max} item(s)",
                describe(actual)
            ));
        }
    }
    Ok(())
}

fn scalar_string(actual: &Value) -> Option<String> {
    match actual {
        Value::Array(_) | Value::Object(_) => None,
        other => Some(value_to_string(other)),
    }
}

/// Check a single rule.
///
/// Structural rules (`eachKey`, `eachValue`, `arrayContains`) only check
/// the container type here; their elements are visited by the body walker.
pub(crate) fn check_rule(rule: &MatchingRule, expected: &Value, actual: &Value) -> Result<(), String> {
    match rule {
        MatchingRule::Equality => {
            if expected == actual {
                Ok(())
            } else {
                Err(format!("Expected {} to equal {}", describe(actual), describe(expected)))
            }
        }
        MatchingRule::Regex(pattern) => {
            let regex = Regex::new(pattern).map_err(|e| format!("Invalid regex '{pattern}': {e}"))?;
            match scalar_string(actual) {
                Some(text) if regex.is_match(&text) => Ok(()),
                _ => Err(format!("Expected {} to match '{pattern}'", describe(actual))),
            }
        }
        MatchingRule::Type => check_type(expected, actual),
        MatchingRule::MinType(min) => {
            check_type(expected, actual)?;
            check_length(actual, Some(*min), None)
        }
        MatchingRule::MaxType(max) => {
            check_type(expected, actual)?;
            check_length(actual, None, Some(*max))
        }
        MatchingRule::MinMaxType(min, max) => {
            check_type(expected, actual)?;
            check_length(actual, Some(*min), Some(*max))
        }
        MatchingRule::Include(fragment) => match scalar_string(actual) {
            Some(text) if text.contains(fragment.as_str()) => Ok(()),
            _ => Err(format!("Expected {} to include '{fragment}'", describe(actual))),
        },
        MatchingRule::Integer => {
            let ok = match actual {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.parse::<i64>().is_ok(),
                _ => false,
            };
            ok.then_some(())
                .ok_or_else(|| format!("Expected {} to be an integer", describe(actual)))
        }
        MatchingRule::Decimal => {
            let ok = match actual {
                Value::Number(n) => n.is_f64(),
                Value::String(s) => s.contains('.') && s.parse::<f64>().is_ok(),
                _ => false,
            };
            ok.then_some(())
                .ok_or_else(|| format!("Expected {} to be a decimal number", describe(actual)))
        }
        MatchingRule::Number => {
            let ok = match actual {
                Value::Number(_) => true,
                Value::String(s) => s.parse::<f64>().is_ok(),
                _ => false,
            };
            ok.then_some(())
                .ok_or_else(|| format!("Expected {} to be a number", describe(actual)))
        }
        MatchingRule::Boolean => {
            let ok = match actual {
                Value::Bool(_) => true,
                Value::String(s) => s == "true" || s == "false",
                _ => false,
            };
            ok.then_some(())
                .ok_or_else(|| format!("Expected {} to be a boolean", describe(actual)))
        }
        MatchingRule::Null => actual
            .is_null()
            .then_some(())
            .ok_or_else(|| format!("Expected {} to be null", describe(actual))),
        MatchingRule::NotEmpty => {
            check_type(expected, actual)?;
            let empty = match actual {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                Value::Bool(_) | Value::Number(_) => false,
            };
            (!empty)
                .then_some(())
                .ok_or_else(|| format!("Expected {} to not be empty", describe(actual)))
        }
        MatchingRule::Date(format) => check_datetime(actual, format, DateKind::Date),
        MatchingRule::Time(format) => check_datetime(actual, format, DateKind::Time),
        MatchingRule::Timestamp(format) => check_datetime(actual, format, DateKind::Timestamp),
        MatchingRule::ContentType(expected_type) => match actual {
            Value::String(text) => check_content_type(expected_type, text.as_bytes(), None),
            other => Err(format!(
                "Expected {} to have content type {expected_type}",
                describe(other)
            )),
        },
        MatchingRule::EachKey(_) => match actual {
            Value::Object(_) => Ok(()),
            other => Err(format!("Expected {} to be an object", describe(other))),
        },
        MatchingRule::EachValue(_) => match actual {
            Value::Object(_) | Value::Array(_) => Ok(()),
            other => Err(format!("Expected {} to be an object or array", describe(other))),
        },
        MatchingRule::ArrayContains(_) => match actual {
            Value::Array(_) => Ok(()),
            other => Err(format!("Expected {} to be an array", describe(other))),
        },
        MatchingRule::StatusCode(status) => {
            let code = actual.as_u64().and_then(|c| u16::try_from(c).ok());
            match code {
                Some(code) if status.contains(code) => Ok(()),
                _ => Err(format!("Expected status {} to be {status:?}", describe(actual))),
            }
        }
    }
}

/// Check raw content against a `contentType` rule.
///
/// The content is sniffed first; formats the sniffer cannot recognise fall
/// back to the declared content type of the actual body.
pub(crate) fn check_content_type(
    expected_type: &str,
    content: &[u8],
    declared: Option<&ContentType>,
) -> Result<(), String> {
    let Ok(expected) = expected_type.parse::<ContentType>() else {
        return Err(format!("'{expected_type}' is not a valid content type"));
    };
    let detected = ContentType::detect(content);
    let generic = matches!(detected.base_type().as_str(), "application/octet-stream" | "text/plain");
    if detected.is_equivalent_to(&expected)
        || (generic && declared.is_some_and(|d| d.is_equivalent_to(&expected)))
    {
        Ok(())
    } else {
        Err(format!(
            "Expected content to have a content type of '{}' but was '{}'",
            expected.base_type(),
            detected.base_type()
        ))
    }
}

#[derive(Clone, Copy)]
enum DateKind {
    Date,
    Time,
    Timestamp,
}

fn check_datetime(actual: &Value, format: &str, kind: DateKind) -> Result<(), String> {
    let Value::String(text) = actual else {
        return Err(format!("Expected {} to be a date/time string", describe(actual)));
    };
    let chrono_format = java_to_chrono(format);
    let has_offset = chrono_format.contains("%z") || chrono_format.contains("%:z");
    let text = if has_offset && text.ends_with('Z') {
        let offset = if chrono_format.contains("%:z") { "+00:00" } else { "+0000" };
        format!("{}{offset}", &text[..text.len() - 1])
    } else {
        text.clone()
    };

    let parsed = match kind {
        DateKind::Date => NaiveDate::parse_from_str(&text, &chrono_format).is_ok(),
        DateKind::Time => NaiveTime::parse_from_str(&text, &chrono_format).is_ok(),
        DateKind::Timestamp if has_offset => DateTime::parse_from_str(&text, &chrono_format).is_ok(),
        DateKind::Timestamp => NaiveDateTime::parse_from_str(&text, &chrono_format).is_ok(),
    };
    if parsed {
        Ok(())
    } else {
        Err(format!("Expected '{text}' to match the format '{format}'"))
    }
}

/// Convert a Java `DateTimeFormatter` style pattern to a chrono format.
pub(crate) fn java_to_chrono(format: &str) -> String {
    let chars: Vec<char> = format.chars().collect();
    let mut out = String::with_capacity(format.len() * 2);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // quoted literal, '' is an escaped quote
            let mut j = i + 1;
            if j < chars.len() && chars[j] == '\'' {
                out.push('\'');
                i = j + 1;
                continue;
            }
            while j < chars.len() {
                if chars[j] == '\'' {
                    if chars.get(j + 1) == Some(&'\'') {
                        out.push('\'');
                        j += 2;
                        continue;
                    }
                    break;
                }
                push_literal(&mut out, chars[j]);
                j += 1;
            }
            i = j + 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            push_literal(&mut out, c);
            i += 1;
            continue;
        }
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let spec = match (c, run) {
            ('y' | 'u', 2) => "%y",
            ('y' | 'u', _) => "%Y",
            ('M' | 'L', 1 | 2) => "%m",
            ('M' | 'L', 3) => "%b",
            ('M' | 'L', _) => "%B",
            ('d', _) => "%d",
            ('D', _) => "%j",
            ('H' | 'k', _) => "%H",
            ('h' | 'K', _) => "%I",
            ('m', _) => "%M",
            ('s', _) => "%S",
            ('S', 3) => "%3f",
            ('S', 6) => "%6f",
            ('S', 9) => "%9f",
            ('S', _) => "%f",
            ('a', _) => "%p",
            ('E', 4..) => "%A",
            ('E', _) => "%a",
            ('X' | 'x', 3..) => "%:z",
            ('X' | 'x' | 'Z', _) => "%z",
            ('z', _) => "%Z",
            _ => {
                for _ in 0..run {
                    push_literal(&mut out, c);
                }
                i += run;
                continue;
            }
        };
        out.push_str(spec);
        i += run;
    }
    out
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpStatus;
    use serde_json::json;

    #[test]
    fn test_java_format_conversion() {
        assert_eq!(java_to_chrono("yyyy-MM-dd"), "%Y-%m-%d");
        assert_eq!(java_to_chrono("HH:mm:ss.SSS"), "%H:%M:%S.%3f");
        assert_eq!(java_to_chrono("yyyy-MM-dd'T'HH:mm:ssXXX"), "%Y-%m-%dT%H:%M:%S%:z");
        assert_eq!(java_to_chrono("EEE, dd MMM yyyy"), "%a, %d %b %Y");
        assert_eq!(java_to_chrono("'o''clock' h a"), "o'clock %I %p");
    }

    #[test]
    fn test_date_rules() {
        let date = MatchingRule::Date("yyyy-MM-dd".into());
        assert!(check_rule(&date, &json!("2020-01-01"), &json!("2024-02-29")).is_ok());
        assert!(check_rule(&date, &json!("2020-01-01"), &json!("2023-02-30")).is_err());
        assert!(check_rule(&date, &json!("2020-01-01"), &json!(20200101)).is_err());

        let ts = MatchingRule::Timestamp("yyyy-MM-dd'T'HH:mm:ssXXX".into());
        assert!(check_rule(&ts, &json!(""), &json!("2024-05-01T10:15:00Z")).is_ok());
        assert!(check_rule(&ts, &json!(""), &json!("2024-05-01T10:15:00+02:00")).is_ok());
        assert!(check_rule(&ts, &json!(""), &json!("2024-05-01 10:15")).is_err());

        let time = MatchingRule::Time("HH:mm".into());
        assert!(check_rule(&time, &json!(""), &json!("23:59")).is_ok());
    }

    #[test]
    fn test_type_rules() {
        assert!(check_rule(&MatchingRule::Type, &json!("a"), &json!("b")).is_ok());
        assert!(check_rule(&MatchingRule::Type, &json!("a"), &json!(1)).is_err());
        assert!(check_rule(&MatchingRule::MinType(2), &json!([1]), &json!([1])).is_err());
        assert!(check_rule(&MatchingRule::MaxType(2), &json!([1]), &json!([1, 2, 3])).is_err());
        assert!(check_rule(&MatchingRule::MinMaxType(1, 3), &json!([1]), &json!([4, 5])).is_ok());
    }

    #[test]
    fn test_number_rules() {
        assert!(check_rule(&MatchingRule::Integer, &json!(1), &json!(42)).is_ok());
        assert!(check_rule(&MatchingRule::Integer, &json!(1), &json!(4.2)).is_err());
        assert!(check_rule(&MatchingRule::Decimal, &json!(1.5), &json!(4.2)).is_ok());
        assert!(check_rule(&MatchingRule::Decimal, &json!(1.5), &json!(4)).is_err());
        assert!(check_rule(&MatchingRule::Number, &json!(1), &json!("12.5")).is_ok());
        assert!(check_rule(&MatchingRule::Boolean, &json!(true), &json!("false")).is_ok());
        assert!(check_rule(&MatchingRule::Null, &json!(null), &json!(0)).is_err());
    }

    #[test]
    fn test_regex_and_include() {
        let regex = MatchingRule::Regex(r"^\d{3}$".into());
        assert!(check_rule(&regex, &json!("123"), &json!("456")).is_ok());
        assert!(check_rule(&regex, &json!("123"), &json!(789)).is_ok());
        assert!(check_rule(&regex, &json!("123"), &json!("4567")).is_err());
        assert!(check_rule(&MatchingRule::Regex("(".into()), &json!(""), &json!("")).is_err());

        let include = MatchingRule::Include("needle".into());
        assert!(check_rule(&include, &json!(""), &json!("haystack needle haystack")).is_ok());
        assert!(check_rule(&include, &json!(""), &json!("haystack")).is_err());
    }

    #[test]
    fn test_or_logic() {
        let list = RuleList {
            rules: vec![MatchingRule::Integer, MatchingRule::Null],
            logic: RuleLogic::Or,
        };
        assert!(check_rules(&list, &json!(1), &json!(null)).is_ok());
        assert!(check_rules(&list, &json!(1), &json!("x")).is_err());
    }

    #[test]
    fn test_status_rule() {
        let rule = MatchingRule::StatusCode(HttpStatus::Success);
        assert!(check_rule(&rule, &json!(200), &json!(204)).is_ok());
        assert!(check_rule(&rule, &json!(200), &json!(404)).is_err());
    }

    #[test]
    fn test_content_type_check() {
        assert!(check_content_type("image/png", b"\x89PNG\r\n\x1a\n....", None).is_ok());
        assert!(check_content_type("image/png", b"%PDF-1.4", None).is_err());
        let protobuf: ContentType = "application/protobuf".parse().unwrap();
        assert!(check_content_type("application/protobuf", &[0x08, 0x96, 0x01], Some(&protobuf)).is_ok());
    }
}
