use chatloom::paths::{canonicalize, get_by_path, set_by_path};
use chatloom::resolver::VariableResolver;
use chatloom::state::StateTree;
use proptest::prelude::*;
use serde_json::{Value, json};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ]
}

fn path() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}", 1..4).prop_map(|segments| segments.join("."))
}

proptest! {
    #[test]
    fn full_match_reference_preserves_the_stored_type(value in scalar()) {
        let mut state = StateTree::new();
        state.set("temp.v", value.clone()).unwrap();
        let resolver = VariableResolver::new(&state);
        prop_assert_eq!(resolver.resolve_value(&json!("{{temp.v}}")), value);
    }

    #[test]
    fn set_then_get_round_trips(path in path(), value in scalar()) {
        let mut data = json!({});
        set_by_path(&mut data, &path, value.clone()).unwrap();
        prop_assert_eq!(get_by_path(&data, &path), Some(&value));
    }

    #[test]
    fn template_resolution_never_panics(text in ".{0,60}") {
        let state = StateTree::new();
        let resolver = VariableResolver::new(&state);
        let _ = resolver.resolve_template(&text);
    }

    #[test]
    fn text_without_references_passes_through(text in "[^{}]{0,60}") {
        let state = StateTree::new();
        let resolver = VariableResolver::new(&state);
        prop_assert_eq!(resolver.resolve_template(&text), text);
    }

    #[test]
    fn canonical_form_ignores_insertion_order(
        pairs in prop::collection::hash_map("[a-z]{1,6}", any::<i64>(), 0..8)
            .prop_map(|m| m.into_iter().collect::<Vec<_>>())
    ) {
        let mut forward = serde_json::Map::new();
        for (k, v) in &pairs {
            forward.insert(k.clone(), json!(v));
        }
        let mut reverse = serde_json::Map::new();
        for (k, v) in pairs.iter().rev() {
            reverse.insert(k.clone(), json!(v));
        }
        prop_assert_eq!(
            canonicalize(&Value::Object(forward.clone())).to_string(),
            canonicalize(&Value::Object(reverse)).to_string()
        );
    }

    #[test]
    fn state_hash_is_a_pure_function_of_content(
        pairs in prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 0..8)
    ) {
        let mut seed = serde_json::Map::new();
        for (k, v) in &pairs {
            seed.insert(k.clone(), json!(v));
        }
        let tree_a = StateTree::from_seed(json!({"user": seed.clone()}));
        let tree_b = StateTree::from_seed(json!({"user": seed}));
        prop_assert_eq!(tree_a.hash(), tree_b.hash());
    }
}
