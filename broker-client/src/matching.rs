//! Headers-exchange matching.
//!
//! A binding's arguments are compared against a message's headers. The special
//! `x-match` argument selects the mode:
//!
//! - `all` (default): every non `x-` argument must be present in the headers
//!   with an equal value. An empty argument set matches every message.
//! - `any`: at least one non `x-` argument must be present with an equal value.

use crate::types::{FieldTable, HeaderValue};

/// Binding argument that selects the match mode.
pub const X_MATCH: &str = "x-match";

/// How a binding's arguments are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    All,
    Any,
}

impl MatchMode {
    /// Read the match mode from binding arguments.
    pub fn from_arguments(arguments: &FieldTable) -> Self {
        match arguments.get(X_MATCH).and_then(HeaderValue::as_str) {
            Some("any") => MatchMode::Any,
            _ => MatchMode::All,
        }
    }
}

/// Whether a message with `headers` matches a binding with `arguments`.
pub fn headers_match(arguments: &FieldTable, headers: &FieldTable) -> bool {
    let mut pairs = arguments
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"));

    match MatchMode::from_arguments(arguments) {
        MatchMode::All => pairs.all(|(key, value)| headers.get(key) == Some(value)),
        MatchMode::Any => pairs.any(|(key, value)| headers.get(key) == Some(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field_table;
    use rstest::rstest;

    fn headers() -> FieldTable {
        let mut table = field_table([("region", "us"), ("product", "p1")]);
        table.insert("firehose".to_string(), HeaderValue::Bool(true));
        table
    }

    #[rstest]
    #[case(field_table([("region", "us")]), true)]
    #[case(field_table([("region", "eu")]), false)]
    #[case(field_table([("region", "us"), ("product", "p1")]), true)]
    #[case(field_table([("region", "us"), ("product", "p2")]), false)]
    #[case(field_table([("missing", "x")]), false)]
    #[case(FieldTable::new(), true)]
    fn test_match_all(#[case] arguments: FieldTable, #[case] expected: bool) {
        assert_eq!(headers_match(&arguments, &headers()), expected);
    }

    #[rstest]
    #[case(field_table([("x-match", "any"), ("region", "eu"), ("product", "p1")]), true)]
    #[case(field_table([("x-match", "any"), ("region", "eu"), ("product", "p2")]), false)]
    #[case(field_table([("x-match", "any")]), false)]
    fn test_match_any(#[case] arguments: FieldTable, #[case] expected: bool) {
        assert_eq!(headers_match(&arguments, &headers()), expected);
    }

    #[test]
    fn test_values_compare_by_type() {
        let arguments = field_table([("firehose", "true")]);
        assert!(!headers_match(&arguments, &headers()));

        let mut arguments = FieldTable::new();
        arguments.insert("firehose".to_string(), HeaderValue::Bool(true));
        assert!(headers_match(&arguments, &headers()));
    }

    #[test]
    fn test_x_prefixed_arguments_are_ignored() {
        let arguments = field_table([("x-match", "all"), ("x-custom", "ignored"), ("region", "us")]);
        assert!(headers_match(&arguments, &headers()));
    }

    #[test]
    fn test_unknown_match_mode_defaults_to_all() {
        let arguments = field_table([("x-match", "bogus"), ("region", "us")]);
        assert_eq!(MatchMode::from_arguments(&arguments), MatchMode::All);
        assert!(headers_match(&arguments, &headers()));
    }
}
