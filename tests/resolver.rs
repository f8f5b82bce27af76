use chatloom::resolver::{VariableResolver, WRITABLE_SCOPES, check_writable};
use chatloom::state::StateTree;
use serde_json::json;

fn seeded_state() -> StateTree {
    let mut state = StateTree::new();
    state.set("user.name", json!("Ada")).unwrap();
    state.set("user.tags", json!(["admin", "beta"])).unwrap();
    state.set("temp.count", json!(5)).unwrap();
    state.set("context.order.total", json!(19.5)).unwrap();
    state
}

#[test]
fn template_substitutes_multiple_references() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state);
    assert_eq!(
        resolver.resolve_template("{{user.name}} has {{temp.count}} points"),
        "Ada has 5 points"
    );
}

#[test]
fn template_traverses_arrays_by_index() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state);
    assert_eq!(resolver.resolve_template("role: {{user.tags.0}}"), "role: admin");
}

#[test]
fn unresolved_reference_is_preserved_by_default() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state);
    assert_eq!(
        resolver.resolve_template("hi {{user.missing}}"),
        "hi {{user.missing}}"
    );
}

#[test]
fn unresolved_reference_can_collapse_to_empty() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state).preserve_unresolved(false);
    assert_eq!(resolver.resolve_template("hi {{user.missing}}!"), "hi !");
}

#[test]
fn unterminated_reference_is_emitted_verbatim() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state);
    assert_eq!(resolver.resolve_template("oops {{user.name"), "oops {{user.name");
}

#[test]
fn full_match_yields_raw_typed_value() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state);
    assert_eq!(resolver.resolve_value(&json!("{{temp.count}}")), json!(5));
    assert_eq!(
        resolver.resolve_value(&json!("{{context.order.total}}")),
        json!(19.5)
    );
    assert_eq!(
        resolver.resolve_value(&json!("{{user.tags}}")),
        json!(["admin", "beta"])
    );
}

#[test]
fn partial_match_stringifies() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state);
    assert_eq!(
        resolver.resolve_value(&json!("count: {{temp.count}}")),
        json!("count: 5")
    );
}

#[test]
fn resolve_value_recurses_into_containers() {
    let state = seeded_state();
    let resolver = VariableResolver::new(&state);
    let resolved = resolver.resolve_value(&json!({
        "who": "{{user.name}}",
        "nested": {"n": "{{temp.count}}"},
        "list": ["{{user.tags.1}}", 7],
    }));
    assert_eq!(
        resolved,
        json!({
            "who": "Ada",
            "nested": {"n": 5},
            "list": ["beta", 7],
        })
    );
}

#[test]
fn overlay_scopes_shadow_session_state() {
    let state = seeded_state();
    let overlay = json!({
        "input": {"amount": 3},
        "local": {"count": 99},
    });
    let resolver = VariableResolver::new(&state).with_overlay(&overlay);
    assert_eq!(resolver.resolve_value(&json!("{{input.amount}}")), json!(3));
    assert_eq!(resolver.resolve_value(&json!("{{local.count}}")), json!(99));
    // Non-overlay scopes still come from the session tree.
    assert_eq!(resolver.resolve_value(&json!("{{temp.count}}")), json!(5));
}

#[test]
fn writable_scope_check() {
    for scope in WRITABLE_SCOPES {
        assert!(check_writable(&format!("{scope}.x")).is_ok());
    }
    assert!(check_writable("user.name").is_err());
    assert!(check_writable("context.x").is_err());
    assert!(check_writable("input.x").is_err());
    assert!(check_writable(".leading.dot").is_err());
}
