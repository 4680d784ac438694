//! Tolerant scalar parsing for operator-entered fields.
//!
//! Dryer logs are typed in by hand, so any reading may be free text. A value
//! that cannot be read as a number becomes `0.0`; every such fallback is
//! logged and counted so callers can report (and tests can assert) how much
//! of a record was guessed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Parses a JSON scalar as a finite number.
pub fn parse_scalar(value: &Value) -> Option<f32> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed as f32)
}

/// Running count of coerced and defaulted scalars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoercionLog {
    /// Values present but unparsable.
    pub coerced: usize,
    /// Values absent and replaced by the default.
    pub defaulted: usize,
}

impl CoercionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `value` as a number, falling back to `0.0`.
    pub fn scalar(&mut self, field: &str, value: Option<&Value>) -> f32 {
        match value {
            None | Some(Value::Null) => {
                self.defaulted += 1;
                debug!(field, "absent value defaulted to 0.0");
                0.0
            }
            Some(raw) => match parse_scalar(raw) {
                Some(v) => v,
                None => {
                    self.coerced += 1;
                    warn!(field, value = %raw, "unparsable value coerced to 0.0");
                    0.0
                }
            },
        }
    }

    pub fn merge(&mut self, other: CoercionLog) {
        self.coerced += other.coerced;
        self.defaulted += other.defaulted;
    }

    pub fn total(&self) -> usize {
        self.coerced + self.defaulted
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_scalar() {
        assert_eq!(parse_scalar(&json!(12.5)), Some(12.5));
        assert_eq!(parse_scalar(&json!(" 80 ")), Some(80.0));
        assert_eq!(parse_scalar(&json!("12,5")), None);
        assert_eq!(parse_scalar(&json!("nan")), None);
        assert_eq!(parse_scalar(&json!(true)), None);
    }

    #[test]
    fn test_coercion_counts() {
        let mut log = CoercionLog::new();
        assert_eq!(log.scalar("cels[0]", Some(&json!("65.5"))), 65.5);
        assert_eq!(log.scalar("cels[1]", Some(&json!("hot"))), 0.0);
        assert_eq!(log.scalar("tapis3", None), 0.0);
        assert_eq!(log.scalar("tapis2", Some(&Value::Null)), 0.0);

        assert_eq!(log.coerced, 1);
        assert_eq!(log.defaulted, 2);
        assert_eq!(log.total(), 3);
        assert!(!log.is_clean());
    }

    #[test]
    fn test_merge() {
        let mut a = CoercionLog { coerced: 1, defaulted: 0 };
        a.merge(CoercionLog { coerced: 2, defaulted: 3 });
        assert_eq!(a, CoercionLog { coerced: 3, defaulted: 3 });
    }
}
