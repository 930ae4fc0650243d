//! Ordering and matching rules for JSON field values.
//!
//! Rows are handled as JSON objects, so filters and sorts need a total order
//! over `serde_json::Value`. The order follows the one Postgres uses for
//! `jsonb`: `null < string < number < boolean < array < object`, with values
//! of the same kind compared naturally. Strings that are both RFC 3339
//! timestamps are compared as instants so that timestamps serialized with
//! different fractional precision still sort chronologically.

use core::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    // Cheap pre-check keeps plain strings off the parser.
    if s.len() < 20 || s.as_bytes().get(10) != Some(&b'T') {
        return None;
    }
    DateTime::parse_from_rfc3339(s).ok()
}

fn compare_strings(a: &str, b: &str) -> Ordering {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(ta), Some(tb)) => ta.cmp(&tb),
        _ => a.cmp(b),
    }
}

/// Total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::String(x), Value::String(y)) => compare_strings(x, y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(i), Some(j)) => i.cmp(&j),
                _ => {
                    let fx = x.as_f64().unwrap_or(f64::NAN);
                    let fy = y.as_f64().unwrap_or(f64::NAN);
                    fx.total_cmp(&fy)
                }
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => xs
            .len()
            .cmp(&ys.len())
            .then_with(|| a.to_string().cmp(&b.to_string())),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Equality consistent with [`compare_values`] (so `1` equals `1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// SQL `LIKE` matching: `%` matches any run of characters, `_` exactly one.
/// A backslash escapes the next pattern character.
pub fn like_matches(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    let (pattern, text): (Vec<char>, Vec<char>) = if case_insensitive {
        (
            pattern.to_lowercase().chars().collect(),
            text.to_lowercase().chars().collect(),
        )
    } else {
        (pattern.chars().collect(), text.chars().collect())
    };

    // Iterative wildcard matcher with single-point backtracking on `%`.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '%' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '_' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }

        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert!(values_equal(&json!(1), &json!(1.0)));
    }

    #[test]
    fn kinds_follow_jsonb_order() {
        assert_eq!(compare_values(&Value::Null, &json!("a")), Ordering::Less);
        assert_eq!(compare_values(&json!("z"), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(99), &json!(false)), Ordering::Less);
    }

    #[test]
    fn timestamps_compare_chronologically() {
        // Whole-second timestamps serialize without a fraction, which breaks
        // plain lexicographic order against fractional ones.
        let whole = json!("2024-05-01T10:00:01Z");
        let fractional = json!("2024-05-01T10:00:00.900Z");
        assert_eq!(compare_values(&fractional, &whole), Ordering::Less);
    }

    #[test]
    fn like_wildcards() {
        assert!(like_matches("%report%", "weekly report draft", false));
        assert!(like_matches("task_1", "task_1", false));
        assert!(like_matches("task_", "task9", false));
        assert!(!like_matches("task_", "task", false));
        assert!(!like_matches("Report%", "report 1", false));
        assert!(like_matches("Report%", "report 1", true));
        assert!(like_matches("100\\%", "100%", false));
        assert!(!like_matches("100\\%", "1000", false));
        assert!(like_matches("%", "", false));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: ordering over integers agrees with native integer ordering
        /// and is antisymmetric.
        #[test]
        fn integer_order_matches_native(a in any::<i64>(), b in any::<i64>()) {
            let ord = compare_values(&json!(a), &json!(b));
            prop_assert_eq!(ord, a.cmp(&b));
            prop_assert_eq!(compare_values(&json!(b), &json!(a)), ord.reverse());
        }

        /// Property: a pattern made of the text itself (no wildcards) matches,
        /// and so does the same text surrounded by `%`.
        #[test]
        fn literal_patterns_match_themselves(text in "[a-z0-9 ]{0,16}") {
            prop_assert!(like_matches(&text, &text, false));
            let wrapped = format!("%{text}%");
            prop_assert!(like_matches(&wrapped, &text, false));
        }
    }
}
