//! Typed overlay values.
//!
//! Overlay declarations arrive as scalars. String values may encode a
//! typed scalar; the conversion rule is applied exactly once, at
//! declaration parse time, never at lookup time.

use serde::{Deserialize, Serialize};

/// A named substitutable value used during template rendering.
///
/// Untagged so that TOML scalars deserialize to their natural variant;
/// strings are then passed through [`OverlayValue::normalize`] to apply
/// the typing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverlayValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl OverlayValue {
    /// Apply the declaration-time typing rule to a string:
    ///
    /// - contains `.` and parses as a float → float
    /// - parses as an integer → integer
    /// - case-insensitive `true`/`false` → boolean
    /// - anything else stays a string
    pub fn from_str_typed(s: &str) -> Self {
        if s.contains('.') {
            if let Ok(f) = s.parse::<f64>() {
                return OverlayValue::Float(f);
            }
        }
        if let Ok(i) = s.parse::<i64>() {
            return OverlayValue::Int(i);
        }
        if s.eq_ignore_ascii_case("true") {
            return OverlayValue::Bool(true);
        }
        if s.eq_ignore_ascii_case("false") {
            return OverlayValue::Bool(false);
        }
        OverlayValue::Str(s.to_string())
    }

    /// Re-type a deserialized value: string variants go through the
    /// typing rule, everything else is already typed.
    pub fn normalize(self) -> Self {
        match self {
            OverlayValue::Str(s) => OverlayValue::from_str_typed(&s),
            other => other,
        }
    }

    /// The value as rendered into template output.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for OverlayValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlayValue::Bool(b) => write!(f, "{b}"),
            OverlayValue::Int(i) => write!(f, "{i}"),
            OverlayValue::Float(x) => write!(f, "{x}"),
            OverlayValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for OverlayValue {
    fn from(s: &str) -> Self {
        OverlayValue::from_str_typed(s)
    }
}

impl From<i64> for OverlayValue {
    fn from(i: i64) -> Self {
        OverlayValue::Int(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_rule() {
        assert_eq!(OverlayValue::from_str_typed("900"), OverlayValue::Int(900));
        assert_eq!(
            OverlayValue::from_str_typed("2.4"),
            OverlayValue::Float(2.4)
        );
        assert_eq!(
            OverlayValue::from_str_typed("TRUE"),
            OverlayValue::Bool(true)
        );
        assert_eq!(
            OverlayValue::from_str_typed("false"),
            OverlayValue::Bool(false)
        );
        assert_eq!(
            OverlayValue::from_str_typed("10.0.0.1"),
            OverlayValue::Str("10.0.0.1".into())
        );
        assert_eq!(
            OverlayValue::from_str_typed("emane01"),
            OverlayValue::Str("emane01".into())
        );
    }

    #[test]
    fn render_matches_declaration() {
        assert_eq!(OverlayValue::from_str_typed("900").render(), "900");
        assert_eq!(OverlayValue::from_str_typed("3.5").render(), "3.5");
        assert_eq!(OverlayValue::from_str_typed("true").render(), "true");
        assert_eq!(OverlayValue::from_str_typed("node-a").render(), "node-a");
    }

    #[test]
    fn normalize_only_touches_strings() {
        assert_eq!(
            OverlayValue::Str("42".into()).normalize(),
            OverlayValue::Int(42)
        );
        assert_eq!(OverlayValue::Int(7).normalize(), OverlayValue::Int(7));
    }
}
