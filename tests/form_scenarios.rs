//! End-to-end behaviour of live forms driven by synchronous rules

use octofhir_formrules::{
    ConfigurationError, DerivationPhase, EngineConfig, Form, FormEngine, FormError,
    FunctionScope,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn build(config: Value) -> Form {
    FormEngine::new()
        .build_form(serde_json::from_value(config).unwrap())
        .unwrap()
}

#[test]
fn test_state_hidden_outside_us() {
    let form = build(json!({"fields": [
        {"key": "name", "value": "Ada"},
        {"key": "country", "type": "select", "value": "US"},
        {"key": "state", "value": "", "logic": [{
            "type": "hidden",
            "condition": {"type": "fieldValue", "fieldPath": "state", "operator": "equals", "value": ""},
            "when": {"type": "fieldValue", "fieldPath": "country", "operator": "notEquals", "value": "US"}
        }]}
    ]}));

    assert!(!form.field("state").unwrap().hidden);
    let name_before = form.field("name").unwrap();

    form.set_value("country", json!("CA")).unwrap();
    assert!(form.field("state").unwrap().hidden);
    assert_eq!(form.field("name").unwrap(), name_before);

    // a filled-in state stays visible
    form.set_value("state", json!("ON")).unwrap();
    assert!(!form.field("state").unwrap().hidden);

    form.set_value("state", json!("")).unwrap();
    form.set_value("country", json!("US")).unwrap();
    assert!(!form.field("state").unwrap().hidden);
}

#[test]
fn test_total_follows_quantity() {
    let form = build(json!({"fields": [
        {"key": "quantity", "value": 3},
        {"key": "unitPrice", "value": 10},
        {"key": "total", "logic": [{
            "type": "derivation",
            "expression": "formValue.quantity * formValue.unitPrice"
        }]}
    ]}));

    assert_eq!(form.get("total").unwrap(), json!(30));
    form.set_value("quantity", json!(5)).unwrap();
    assert_eq!(form.get("total").unwrap(), json!(50));
    assert_eq!(
        form.derivation_phases("total").unwrap(),
        vec![DerivationPhase::Applied]
    );
    // derived writes are not user edits
    assert!(!form.field("total").unwrap().dirty);
}

#[test]
fn test_password_confirmation() {
    let form = build(json!({"fields": [
        {"key": "password", "value": "abc"},
        {"key": "confirmPassword", "validators": [{
            "type": "custom",
            "expression": "fieldValue === formValue.password",
            "kind": "passwordMismatch"
        }]}
    ]}));

    form.set_value("confirmPassword", json!("abc")).unwrap();
    assert!(form.field("confirmPassword").unwrap().is_valid());
    assert!(form.is_valid());

    form.set_value("confirmPassword", json!("xyz")).unwrap();
    let field = form.field("confirmPassword").unwrap();
    assert_eq!(field.errors.len(), 1);
    assert_eq!(field.errors[0].kind, "passwordMismatch");

    // the rule is cross-field: changing the password re-validates the confirmation
    form.set_value("password", json!("xyz")).unwrap();
    assert!(form.field("confirmPassword").unwrap().is_valid());
}

#[test]
fn test_derivation_chain_reads_settled_values() {
    let seen: Arc<Mutex<Vec<(Value, Value)>>> = Arc::default();
    let record = Arc::clone(&seen);
    let engine = FormEngine::builder()
        .register_functions(move |functions| {
            functions.register_derivation("plusOne", FunctionScope::Form, move |context| {
                let a = context.form_value["a"].clone();
                let b = context.form_value["b"].clone();
                record.lock().push((a, b.clone()));
                Ok(json!(b.as_i64().unwrap_or(0) + 1))
            });
        })
        .build();

    // `c` is declared before the derivation it reads
    let form = engine
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "c", "logic": [{"type": "derivation", "functionName": "plusOne", "dependsOn": ["b"]}]},
                {"key": "b", "logic": [{"type": "derivation", "expression": "formValue.a * 2"}]},
                {"key": "a", "value": 1}
            ]}))
            .unwrap(),
        )
        .unwrap();

    assert_eq!(form.get("c").unwrap(), json!(3));
    form.set_value("a", json!(5)).unwrap();
    assert_eq!(form.get("b").unwrap(), json!(10));
    assert_eq!(form.get("c").unwrap(), json!(11));

    for (a, b) in seen.lock().iter() {
        assert_eq!(b.as_i64(), a.as_i64().map(|a| a * 2), "c observed a stale b");
    }
}

#[test]
fn test_whole_form_derivation_feeds_its_readers() {
    let seen: Arc<Mutex<Vec<(Value, Value)>>> = Arc::default();
    let record = Arc::clone(&seen);
    let engine = FormEngine::builder()
        .register_functions(move |functions| {
            functions.register_derivation("double", FunctionScope::Form, |context| {
                Ok(json!(context.form_value["a"].as_i64().unwrap_or(0) * 2))
            });
            functions.register_derivation("sum", FunctionScope::Form, move |context| {
                let a = context.form_value["a"].clone();
                let b = context.form_value["b"].clone();
                record.lock().push((a.clone(), b.clone()));
                Ok(json!(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0)))
            });
        })
        .build();

    let form = engine
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "a", "value": 1},
                {"key": "c", "derivations": [{"functionName": "sum", "dependsOn": ["a", "b"]}]},
                {"key": "b", "derivations": [{"functionName": "double"}]}
            ]}))
            .unwrap(),
        )
        .unwrap();
    assert!(form.configuration_errors().is_empty());
    assert_eq!(form.get("c").unwrap(), json!(3));

    seen.lock().clear();
    form.set_value("a", json!(5)).unwrap();
    assert_eq!(form.get("b").unwrap(), json!(10));
    assert_eq!(form.get("c").unwrap(), json!(15));
    assert_eq!(*seen.lock(), vec![(json!(5), json!(10))]);
}

#[test]
fn test_user_override_freezes_derivation() {
    let form = build(json!({"fields": [
        {"key": "quantity", "value": 2},
        {"key": "price", "value": 4},
        {"key": "total", "logic": [{
            "type": "derivation",
            "expression": "formValue.quantity * formValue.price",
            "stopOnUserOverride": true
        }]}
    ]}));
    assert_eq!(form.get("total").unwrap(), json!(8));

    form.set_value("total", json!(99)).unwrap();
    let total = form.field("total").unwrap();
    assert!(total.user_overridden);
    assert!(total.dirty);

    form.set_value("quantity", json!(3)).unwrap();
    assert_eq!(form.get("total").unwrap(), json!(99));
    assert_eq!(
        form.derivation_phases("total").unwrap(),
        vec![DerivationPhase::UserOverridden]
    );
}

#[test]
fn test_user_override_re_engages() {
    let form = build(json!({"fields": [
        {"key": "quantity", "value": 2},
        {"key": "price", "value": 4},
        {"key": "total", "logic": [{
            "type": "derivation",
            "expression": "formValue.quantity * formValue.price",
            "stopOnUserOverride": true,
            "reEngageOnDependencyChange": true
        }]}
    ]}));

    form.set_value("total", json!(99)).unwrap();
    assert_eq!(form.get("total").unwrap(), json!(99));

    form.set_value("quantity", json!(3)).unwrap();
    assert_eq!(form.get("total").unwrap(), json!(12));
    assert!(!form.field("total").unwrap().user_overridden);
}

#[test]
fn test_programmatic_writes_do_not_override() {
    let form = build(json!({"fields": [
        {"key": "quantity", "value": 2},
        {"key": "total", "logic": [{
            "type": "derivation",
            "expression": "formValue.quantity * 10",
            "stopOnUserOverride": true
        }]}
    ]}));

    form.patch_value("total", json!(1)).unwrap();
    form.set_value("quantity", json!(3)).unwrap();
    assert_eq!(form.get("total").unwrap(), json!(30));
}

#[test]
fn test_derivation_condition_and_property() {
    let form = build(json!({"fields": [
        {"key": "country", "value": "US"},
        {"key": "phone", "props": {"placeholder": "Phone"}, "derivations": [
            {"targetProperty": "placeholder", "expression": "formValue.country == 'US' ? '(555) 555-5555' : '+00 000'"},
            {"value": "+1 ", "condition": {"type": "fieldValue", "fieldPath": "country", "operator": "equals", "value": "US"}}
        ]}
    ]}));

    let phone = form.field("phone").unwrap();
    assert_eq!(phone.props["placeholder"], json!("(555) 555-5555"));
    assert_eq!(phone.value, json!("+1 "));

    form.set_value("phone", json!("+1 212")).unwrap();
    form.set_value("country", json!("DE")).unwrap();
    let phone = form.field("phone").unwrap();
    assert_eq!(phone.props["placeholder"], json!("+00 000"));
    // gated off: the value is left alone
    assert_eq!(phone.value, json!("+1 212"));
}

#[test]
fn test_hidden_fields_do_not_block_validity() {
    let form = build(json!({"fields": [
        {"key": "customerType", "value": "private"},
        {"key": "company", "validators": [{"type": "required"}], "logic": [{
            "type": "hidden",
            "condition": {"type": "fieldValue", "fieldPath": "customerType", "operator": "notEquals", "value": "business"}
        }]}
    ]}));

    assert!(form.is_valid());
    assert!(form.errors().is_empty());

    form.set_value("customerType", json!("business")).unwrap();
    assert!(!form.is_valid());
    assert_eq!(form.errors()["company"][0].kind, "required");

    form.set_value("company", json!("ACME")).unwrap();
    assert!(form.is_valid());
}

#[test]
fn test_hidden_fields_counted_when_configured() {
    let engine = FormEngine::builder()
        .with_config(EngineConfig {
            skip_hidden_validation: false,
            ..EngineConfig::default()
        })
        .build();
    let form = engine
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "company", "validators": [{"type": "required"}],
                 "logic": [{"type": "hidden", "condition": true}]}
            ]}))
            .unwrap(),
        )
        .unwrap();
    assert!(form.field("company").unwrap().hidden);
    assert!(!form.is_valid());
}

#[test]
fn test_state_inherited_from_containers() {
    let form = build(json!({"fields": [
        {"key": "sameAsBilling", "value": true},
        {"key": "shipping", "type": "group",
         "logic": [{"type": "hidden", "condition": {"type": "javascript", "expression": "formValue.sameAsBilling"}}],
         "fields": [
            {"key": "city", "logic": [{"type": "required", "condition": true}]}
         ]}
    ]}));

    let city = form.field("shipping.city").unwrap();
    assert!(city.hidden);
    assert!(city.required);
    // hidden: the implicit required error does not count
    assert!(form.is_valid());

    form.set_value("sameAsBilling", json!(false)).unwrap();
    let city = form.field("shipping.city").unwrap();
    assert!(!city.hidden);
    assert_eq!(city.errors[0].kind, "required");
    assert!(!form.is_valid());
}

#[test]
fn test_form_state_logic() {
    let form = build(json!({"fields": [
        {"key": "email", "validators": [{"type": "required"}, {"type": "email"}]},
        {"key": "submit", "type": "button", "logic": [
            {"type": "disabled", "condition": "formInvalid"},
            {"type": "readonly", "condition": "formSubmitting"}
        ]}
    ]}));

    assert!(form.field("submit").unwrap().disabled);
    form.set_value("email", json!("not-an-email")).unwrap();
    assert!(form.field("submit").unwrap().disabled);
    form.set_value("email", json!("ada@example.com")).unwrap();
    assert!(!form.field("submit").unwrap().disabled);

    form.set_submitting(true);
    assert!(form.field("submit").unwrap().readonly);
    form.set_submitting(false);
    assert!(!form.field("submit").unwrap().readonly);
}

#[test]
fn test_page_invalid_only_sees_its_page() {
    let form = build(json!({"fields": [
        {"key": "personal", "type": "page", "fields": [
            {"key": "name", "validators": [{"type": "required"}]},
            {"key": "next", "type": "button", "logic": [{"type": "disabled", "condition": "pageInvalid"}]}
        ]},
        {"key": "details", "type": "page", "fields": [
            {"key": "age", "validators": [{"type": "required"}]}
        ]}
    ]}));

    assert!(form.field("next").unwrap().disabled);
    form.set_value("name", json!("Ada")).unwrap();
    assert!(!form.field("next").unwrap().disabled);
    assert!(!form.is_valid());
}

#[test]
fn test_array_items_get_their_own_rules() {
    let form = build(json!({"fields": [
        {"key": "items", "type": "array",
         "value": [{"quantity": 2, "price": 3}],
         "template": [
            {"key": "quantity", "value": 1, "validators": [{"type": "min", "value": 1}]},
            {"key": "price", "value": 0},
            {"key": "lineTotal", "logic": [{
                "type": "derivation",
                "expression": "formValue.items[$index].quantity * formValue.items[$index].price"
            }]}
         ]}
    ]}));
    assert_eq!(form.get("items.0.lineTotal").unwrap(), json!(6));

    let index = form
        .add_array_item("items", Some(json!({"quantity": 4, "price": 5})))
        .unwrap();
    assert_eq!(index, 1);
    assert_eq!(form.get("items[1].lineTotal").unwrap(), json!(20));

    form.set_value("items.1.quantity", json!(0)).unwrap();
    assert_eq!(form.field("items.1.quantity").unwrap().errors[0].kind, "min");
    assert!(form.field("items.0.quantity").unwrap().is_valid());

    form.remove_array_item("items", 0).unwrap();
    assert_eq!(form.get("items").unwrap().as_array().unwrap().len(), 1);
    // the surviving item moved to position 0 with its rules and state
    let quantity = form.field("items.0.quantity").unwrap();
    assert_eq!(quantity.errors[0].kind, "min");
    assert!(quantity.dirty);

    form.set_value("items.0.quantity", json!(3)).unwrap();
    assert_eq!(form.get("items.0.lineTotal").unwrap(), json!(15));
    assert!(matches!(form.field("items.1.quantity"), Err(FormError::UnknownField(_))));
}

/// Order lines with a debounced slug and an async product lookup
fn catalog_form(resolved: Arc<Mutex<Vec<String>>>) -> Form {
    FormEngine::builder()
        .register_functions(move |functions| {
            functions.register_async_fn("productName", FunctionScope::Form, move |context| {
                let resolved = Arc::clone(&resolved);
                async move {
                    let index = context.index.unwrap_or_default();
                    let sku = context.form_value["items"][index]["sku"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    resolved.lock().push(sku.clone());
                    Ok(json!(format!("Product {sku}")))
                }
            });
        })
        .build()
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "items", "type": "array", "value": [{"sku": "A"}, {"sku": "B"}], "template": [
                    {"key": "sku"},
                    {"key": "slug", "derivations": [{
                        "expression": "formValue.items[$index].sku + '-slug'",
                        "trigger": "debounced",
                        "debounceMs": 300
                    }]},
                    {"key": "name", "derivations": [{
                        "asyncFunctionName": "productName",
                        "dependsOn": ["items.$index.sku"]
                    }]}
                ]}
            ]}))
            .unwrap(),
        )
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_removed_items_cancel_their_rules() {
    let resolved: Arc<Mutex<Vec<String>>> = Arc::default();
    let form = catalog_form(Arc::clone(&resolved));
    form.settled().await;
    assert_eq!(form.get("items.1.slug").unwrap(), json!("B-slug"));
    assert_eq!(form.get("items.1.name").unwrap(), json!("Product B"));

    // inside the debounce window, with the lookup in flight
    form.set_value("items.1.sku", json!("BB")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(form.is_pending());
    form.remove_array_item("items", 1).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(form.get("items.1").unwrap(), Value::Null);
    assert_eq!(form.get("items.0.slug").unwrap(), json!("A-slug"));
    assert_eq!(form.get("items.0.name").unwrap(), json!("Product A"));
    assert!(!resolved.lock().contains(&"BB".to_string()));
    assert!(!form.is_pending());

    // lookup in flight only
    let index = form.add_array_item("items", Some(json!({"sku": "Z"}))).unwrap();
    assert_eq!(index, 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(form.is_pending());
    form.remove_array_item("items", 1).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(form.get("items").unwrap().as_array().map(Vec::len), Some(1));
    assert_eq!(form.get("items.1").unwrap(), Value::Null);
    assert!(!resolved.lock().contains(&"Z".to_string()));
    assert!(!form.is_pending());
}

#[test]
fn test_array_item_defaults_from_template() {
    let form = build(json!({"fields": [
        {"key": "contacts", "type": "array", "template": [
            {"key": "kind", "value": "email"},
            {"key": "address", "validators": [{"type": "required"}]}
        ]}
    ]}));
    assert!(form.is_valid());

    form.add_array_item("contacts", None).unwrap();
    assert_eq!(
        form.get("contacts.0").unwrap(),
        json!({"kind": "email", "address": null})
    );
    assert!(!form.is_valid());
}

#[test]
fn test_array_operation_errors() {
    let form = build(json!({"fields": [
        {"key": "name"},
        {"key": "tags", "type": "array", "template": [{"key": "label"}]}
    ]}));

    assert!(matches!(
        form.add_array_item("name", None),
        Err(FormError::NotAnArray(path)) if path == "name"
    ));
    assert!(matches!(
        form.remove_array_item("tags", 0),
        Err(FormError::IndexOutOfBounds { index: 0, len: 0, .. })
    ));
    assert!(matches!(
        form.set_value("missing", json!(1)),
        Err(FormError::UnknownField(_))
    ));
}

#[test]
fn test_schema_applied_when_condition_holds() {
    let engine = FormEngine::builder()
        .register_schema(
            "usAddress",
            serde_json::from_value(json!({
                "fields": {
                    "zip": {"validators": [{"type": "pattern", "value": "\\d{5}", "kind": "zip"}]},
                    "state": {"logic": [{"type": "required", "condition": true}]}
                }
            }))
            .unwrap(),
        )
        .build();
    let form = engine
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "country", "value": "DE"},
                {"key": "address", "type": "group",
                 "schemas": [{"type": "applyWhen", "schema": "usAddress",
                              "condition": {"type": "fieldValue", "fieldPath": "country", "operator": "equals", "value": "US"}}],
                 "fields": [{"key": "zip", "value": "1234"}, {"key": "state"}]}
            ]}))
            .unwrap(),
        )
        .unwrap();

    assert!(form.is_valid());
    form.set_value("country", json!("US")).unwrap();
    assert_eq!(form.field("address.zip").unwrap().errors[0].kind, "zip");
    assert!(form.field("address.state").unwrap().required);

    form.set_value("address.zip", json!("12345")).unwrap();
    form.set_value("address.state", json!("NY")).unwrap();
    assert!(form.is_valid());
}

#[test]
fn test_strict_mode_rejects_cycles() {
    let config = json!({"fields": [
        {"key": "a", "logic": [{"type": "derivation", "expression": "formValue.b + 1"}]},
        {"key": "b", "logic": [{"type": "derivation", "expression": "formValue.a + 1"}]}
    ]});

    let error = FormEngine::new()
        .build_form(serde_json::from_value(config.clone()).unwrap())
        .unwrap_err();
    let FormError::Configuration(errors) = error else {
        panic!("expected a configuration error");
    };
    assert!(matches!(
        errors.as_slice(),
        [ConfigurationError::DerivationCycle { cycle }] if cycle.first() == cycle.last() && cycle.len() == 3
    ));

    // lenient mode builds; the cycle runs a bounded number of passes
    let form = FormEngine::builder()
        .with_config(EngineConfig::lenient())
        .build()
        .build_form(serde_json::from_value(config).unwrap())
        .unwrap();
    assert_eq!(form.configuration_errors().len(), 1);
    assert!(form.set_value("a", json!(1)).is_ok());
}

#[test]
fn test_unrecognized_rules_are_diagnostics() {
    let form = build(json!({"fields": [
        {"key": "iban", "validators": [{"type": "iban"}, {"type": "required"}]}
    ]}));
    assert!(form.configuration_errors().is_empty());
    assert_eq!(form.diagnostics().len(), 1);
    assert_eq!(form.diagnostics()[0].field.as_deref(), Some("iban"));
    assert!(!form.is_valid());
}

#[test]
fn test_touched_and_dirty() {
    let form = build(json!({"fields": [{"key": "a"}, {"key": "b"}]}));
    form.mark_touched("a").unwrap();
    form.patch_value("b", json!(1)).unwrap();

    let a = form.field("a").unwrap();
    assert!(a.touched && !a.dirty);
    let b = form.field("b").unwrap();
    assert!(!b.touched && !b.dirty);

    form.set_value("b", json!(2)).unwrap();
    assert!(form.field("b").unwrap().dirty);
}
