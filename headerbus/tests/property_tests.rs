//! Property-based tests for routing headers and header matching
//!
//! Each test is tagged with the property it validates.

use broker_client::headers_match;
use headerbus::envelope::ROUTING_HEADER_NAMES;
use headerbus::{
    field_table, ConfigurationError, EventHeaders, FieldTable, MessageOptions, RoutingHeaders,
};
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn value_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}"
}

/// Headers with each field independently present or absent
fn headers_strategy() -> impl Strategy<Value = EventHeaders> {
    (
        proptest::option::of(any::<bool>()),
        proptest::option::of(value_strategy()),
        proptest::option::of(value_strategy()),
        proptest::option::of(value_strategy()),
    )
        .prop_map(|(firehose, product, component, event_type)| EventHeaders {
            firehose,
            product,
            component,
            event_type,
        })
}

fn routing_strategy() -> impl Strategy<Value = RoutingHeaders> {
    (any::<bool>(), value_strategy(), value_strategy(), value_strategy()).prop_map(
        |(firehose, product, component, event_type)| {
            RoutingHeaders::new(firehose, product, component, event_type)
        },
    )
}

fn present_count(headers: &EventHeaders) -> usize {
    ROUTING_HEADER_NAMES.len() - headers.missing().len()
}

// ============================================================================
// Property 1: All-Or-Nothing Routing Headers
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// **Feature: tagged-routing, Property 1: All-Or-Nothing Routing Headers**
    ///
    /// *For any* combination of present and absent routing headers, the event SHALL be
    /// routable when all four are present, untagged when none are, and rejected with
    /// the exact set of missing header names otherwise.
    #[test]
    fn prop_routing_headers_all_or_nothing(headers in headers_strategy()) {
        match (present_count(&headers), headers.routing()) {
            (4, Ok(Some(routing))) => {
                prop_assert_eq!(EventHeaders::from(routing), headers);
            }
            (0, Ok(None)) => {}
            (_, Err(ConfigurationError::IncompleteRoutingHeaders { missing })) => {
                prop_assert!(!missing.is_empty() && missing.len() < 4);
                prop_assert_eq!(missing, headers.missing());
            }
            (count, result) => {
                prop_assert!(false, "{} headers present gave {:?}", count, result);
            }
        }
    }

    /// **Feature: tagged-routing, Property 2: Dropping One Header Rejects The Event**
    ///
    /// *For any* complete routing header set, removing exactly one header SHALL make
    /// the event unroutable, naming only that header as missing.
    #[test]
    fn prop_missing_one_header_is_rejected(
        routing in routing_strategy(),
        dropped in 0usize..4,
    ) {
        let mut headers = EventHeaders::from(routing);
        match dropped {
            0 => headers.firehose = None,
            1 => headers.product = None,
            2 => headers.component = None,
            _ => headers.event_type = None,
        }

        prop_assert_eq!(
            headers.routing(),
            Err(ConfigurationError::IncompleteRoutingHeaders {
                missing: vec![ROUTING_HEADER_NAMES[dropped]],
            })
        );
    }

    /// **Feature: tagged-routing, Property 3: Header Table Round Trip**
    ///
    /// *For any* routing header set and extra headers, reading the published header
    /// table back SHALL recover the same routing headers and the extra headers alone.
    #[test]
    fn prop_header_table_round_trip(
        routing in routing_strategy(),
        region in value_strategy(),
    ) {
        let extra = field_table([("region", region.as_str())]);
        let mut table = MessageOptions::new().with_header("region", region.as_str()).headers;
        table.extend(routing.to_field_table());

        let (headers, rest) = EventHeaders::from_field_table(&table);
        prop_assert_eq!(headers.routing(), Ok(Some(routing)));
        prop_assert_eq!(rest, extra);
    }
}

// ============================================================================
// Property 4: Binding Matches Its Own Headers
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Feature: tagged-routing, Property 4: Binding Matches Its Own Headers**
    ///
    /// *For any* routing header set, a binding built from any subset of those headers
    /// SHALL match an event carrying them, and a binding on a different product SHALL not.
    #[test]
    fn prop_subset_binding_matches(
        routing in routing_strategy(),
        keep in proptest::collection::vec(any::<bool>(), 4),
    ) {
        let message = routing.to_field_table();
        let binding: FieldTable = message
            .iter()
            .zip(&keep)
            .filter(|(_, keep)| **keep)
            .map(|((key, value), _)| (key.clone(), value.clone()))
            .collect();
        prop_assert!(headers_match(&binding, &message));

        let other = field_table([("headerbus_product", format!("{}-other", routing.product))]);
        prop_assert!(!headers_match(&other, &message));
    }
}
