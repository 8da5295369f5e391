//! Proptest generators for contract values.

use proptest::prelude::*;
use serde_json::{Map, Value};

/// Generate consumer and provider names.
pub fn pacticipant_strategy() -> impl Strategy<Value = String> {
    "[A-Z][a-z]{2,10}( [A-Z][a-z]{2,8})?"
}

/// Generate interaction descriptions.
pub fn description_strategy() -> impl Strategy<Value = String> {
    "a request (for|to) [a-z]{3,12}( [a-z]{2,8}){0,3}"
}

/// Generate HTTP methods.
pub fn http_method_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("GET".to_string()),
        Just("POST".to_string()),
        Just("PUT".to_string()),
        Just("DELETE".to_string()),
        Just("PATCH".to_string()),
    ]
}

/// Generate request paths.
pub fn path_strategy() -> impl Strategy<Value = String> {
    "(/[a-z][a-z0-9-]{0,12}){1,4}"
}

/// Generate query parameter names.
pub fn query_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z_]{0,10}"
}

/// Generate query parameter value lists.
pub fn query_values_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Za-z0-9 ]{0,12}", 1..5)
}

/// Generate response status codes.
pub fn status_strategy() -> impl Strategy<Value = u16> {
    prop_oneof![
        Just(200u16),
        Just(201u16),
        Just(204u16),
        Just(400u16),
        Just(404u16),
        Just(409u16),
        Just(500u16),
    ]
}

fn json_leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::from),
        "[a-z0-9 ]{0,16}".prop_map(Value::String),
        Just(Value::Null),
    ]
}

/// Generate small flat JSON objects.
pub fn json_object_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z][a-zA-Z]{0,8}", json_leaf_strategy(), 0..6)
        .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>()))
}

/// Generate compact JSON object text with keys in arbitrary order.
pub fn json_object_text_strategy() -> impl Strategy<Value = String> {
    prop::collection::btree_map("[a-z][a-zA-Z]{0,8}", json_leaf_strategy(), 1..6)
        .prop_map(|fields| fields.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
        .prop_map(|fields| {
            let members: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!("{}:{value}", Value::from(key.as_str())))
                .collect();
            format!("{{{}}}", members.join(","))
        })
}
