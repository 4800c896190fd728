//! Debouncing and async resolution under a paused tokio clock

use octofhir_formrules::registry::{FunctionError, HttpError, MockHttpTransport};
use octofhir_formrules::runtime::ASYNC_FAILURE_KIND;
use octofhir_formrules::{
    AsyncFailurePolicy, DiagnosticCode, EngineConfig, Form, FormEngine, FunctionScope,
    ValidationError,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Query form whose `results` field hides itself through a debounced, counted condition
fn debounced_search(calls: Arc<AtomicUsize>, seen: Arc<Mutex<Value>>) -> Form {
    FormEngine::builder()
        .register_functions(move |functions| {
            functions.register_condition("countCalls", FunctionScope::Form, move |context| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = context.form_value["query"].clone();
                Ok(false)
            });
        })
        .build()
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "query", "value": ""},
                {"key": "results", "logic": [{
                    "type": "hidden",
                    "trigger": "debounced",
                    "debounceMs": 300,
                    "condition": {"type": "custom", "expression": "countCalls"}
                }]}
            ]}))
            .unwrap(),
        )
        .unwrap()
}

fn availability_form(transport: Arc<MockHttpTransport>, cache_ms: Option<u64>) -> Form {
    let mut validator = json!({
        "type": "http",
        "http": {
            "url": "https://api.example.com/users/check",
            "queryParams": {"username": "fieldValue"}
        },
        "responseExpression": "response.available",
        "kind": "usernameTaken"
    });
    if let Some(ms) = cache_ms {
        validator["cacheDurationMs"] = json!(ms);
    }
    FormEngine::builder()
        .with_transport(transport)
        .build()
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "username", "value": "bob", "validators": [validator]}
            ]}))
            .unwrap(),
        )
        .unwrap()
}

fn availability_transport() -> MockHttpTransport {
    MockHttpTransport::new(|request| Ok(json!({"available": !request.url.contains("taken")})))
}

#[tokio::test(start_paused = true)]
async fn test_debounced_rule_runs_once_per_burst() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Value::Null));
    let form = debounced_search(calls.clone(), seen.clone());

    // build-time evaluation is immediate
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    for query in ["r", "ru", "rus", "rust", "rusty"] {
        form.set_value("query", json!(query)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(form.is_pending());

    form.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock(), json!("rusty"));
    assert!(!form.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_debounce_window_restarts_on_each_edit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let form = debounced_search(calls.clone(), Arc::new(Mutex::new(Value::Null)));

    form.set_value("query", json!("a")).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    form.set_value("query", json!("ab")).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_debounce_without_runtime_evaluates_immediately() {
    let calls = Arc::new(AtomicUsize::new(0));
    let form = debounced_search(calls.clone(), Arc::new(Mutex::new(Value::Null)));

    assert!(
        form.diagnostics()
            .iter()
            .any(|d| d.code == DiagnosticCode::NoAsyncRuntime)
    );

    form.set_value("query", json!("now")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!form.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_http_validator_last_request_wins() {
    let transport = Arc::new(availability_transport().with_delay(Duration::from_millis(100)));
    let form = availability_form(transport.clone(), None);
    form.settled().await;
    assert_eq!(transport.calls(), 1);
    assert!(form.is_valid());

    form.set_value("username", json!("tak")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.calls(), 2);
    assert!(form.is_pending());
    // pending validators do not block
    assert!(form.is_valid());

    form.set_value("username", json!("taken")).unwrap();
    form.settled().await;

    assert_eq!(transport.calls(), 3);
    let requests = transport.requests();
    assert!(requests.last().unwrap().url.contains("username=taken"));

    let field = form.field("username").unwrap();
    assert!(field.error("usernameTaken").is_some());
    assert!(!form.is_valid());
    assert!(!form.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_http_responses_cached_for_duration() {
    let transport = Arc::new(availability_transport());
    let form = availability_form(transport.clone(), Some(60_000));
    form.settled().await;

    form.set_value("username", json!("alice")).unwrap();
    form.settled().await;
    assert_eq!(transport.calls(), 2);

    form.set_value("username", json!("bob")).unwrap();
    form.settled().await;
    assert_eq!(transport.calls(), 2);
    assert!(form.is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_http_responses_not_cached_by_default() {
    let transport = Arc::new(availability_transport());
    let form = availability_form(transport.clone(), None);
    form.settled().await;

    form.set_value("username", json!("alice")).unwrap();
    form.settled().await;
    form.set_value("username", json!("bob")).unwrap();
    form.settled().await;
    assert_eq!(transport.calls(), 3);
}

fn city_form() -> Form {
    FormEngine::builder()
        .register_functions(|functions| {
            functions.register_async_fn("lookupCity", FunctionScope::Form, |context| async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                match context.form_value["zip"].as_str() {
                    Some("10115") => Ok(json!("Berlin")),
                    Some("20095") => Ok(json!("Hamburg")),
                    other => Err(FunctionError::evaluation(
                        "lookupCity",
                        format!("unknown zip {other:?}"),
                    )),
                }
            });
        })
        .build()
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "zip", "value": "10115"},
                {"key": "city", "derivations": [{
                    "asyncFunctionName": "lookupCity",
                    "pendingValue": "Loading..."
                }]}
            ]}))
            .unwrap(),
        )
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_async_derivation_shows_pending_value() {
    let form = city_form();
    assert_eq!(form.get("city").unwrap(), json!("Loading..."));
    assert!(form.is_pending());

    form.settled().await;
    assert_eq!(form.get("city").unwrap(), json!("Berlin"));

    form.set_value("zip", json!("20095")).unwrap();
    assert_eq!(form.get("city").unwrap(), json!("Loading..."));
    form.settled().await;
    assert_eq!(form.get("city").unwrap(), json!("Hamburg"));
}

#[tokio::test(start_paused = true)]
async fn test_async_derivation_failure_keeps_last_good() {
    let form = city_form();
    form.settled().await;

    form.set_value("zip", json!("00000")).unwrap();
    form.settled().await;
    assert_eq!(form.get("city").unwrap(), json!("Berlin"));
    assert!(!form.is_pending());
}

fn email_form(config: EngineConfig, calls: Arc<AtomicUsize>) -> Form {
    FormEngine::builder()
        .with_config(config)
        .register_functions(move |functions| {
            functions.register_async_validator_fn("uniqueEmail", FunctionScope::Field, move |context| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    match context.field_value.as_str() {
                        Some("down@example.com") => {
                            Err(FunctionError::evaluation("uniqueEmail", "directory unavailable"))
                        }
                        Some("taken@example.com") => Ok(Some(ValidationError::new("emailTaken"))),
                        _ => Ok(None),
                    }
                }
            });
        })
        .build()
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "email", "value": "new@example.com", "validators": [
                    {"type": "email"},
                    {"type": "customAsync", "functionName": "uniqueEmail"}
                ]}
            ]}))
            .unwrap(),
        )
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_async_validator_reports_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let form = email_form(EngineConfig::default(), calls.clone());
    form.settled().await;
    assert!(form.is_valid());

    form.set_value("email", json!("taken@example.com")).unwrap();
    assert!(form.is_pending());
    form.settled().await;

    assert!(form.field("email").unwrap().error("emailTaken").is_some());
    assert!(!form.is_valid());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // same value again is answered from the slot
    form.mark_touched("email").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_async_failure_policy() {
    let lenient = email_form(EngineConfig::default(), Arc::new(AtomicUsize::new(0)));
    lenient.set_value("email", json!("down@example.com")).unwrap();
    lenient.settled().await;
    assert!(lenient.is_valid());

    let strict = email_form(
        EngineConfig {
            async_validator_failure: AsyncFailurePolicy::TreatAsInvalid,
            ..EngineConfig::default()
        },
        Arc::new(AtomicUsize::new(0)),
    );
    strict.set_value("email", json!("down@example.com")).unwrap();
    strict.settled().await;
    assert!(strict.field("email").unwrap().error(ASYNC_FAILURE_KIND).is_some());
    assert!(!strict.is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_http_failure_treated_as_valid() {
    let transport = Arc::new(MockHttpTransport::new(|_| {
        Err(HttpError::Status {
            status: 503,
            url: "https://api.example.com/users/check".to_string(),
        })
    }));
    let form = availability_form(transport.clone(), None);
    form.settled().await;
    assert_eq!(transport.calls(), 1);
    assert!(form.is_valid());
}

/// `company` hides itself while the VAT number is not a German one
fn vat_form(vat: &str) -> Form {
    FormEngine::builder()
        .register_functions(|functions| {
            functions.register_async_fn("isForeignVat", FunctionScope::Form, |context| async move {
                let vat = context.form_value["vat"].as_str().unwrap_or_default().to_string();
                // foreign numbers take longer to verify
                let delay = if vat.starts_with("DE") { 10 } else { 100 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if vat == "bad" {
                    return Err(FunctionError::evaluation("isForeignVat", "registry unavailable"));
                }
                Ok(json!(!vat.starts_with("DE")))
            });
        })
        .build()
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "vat", "value": vat},
                {"key": "company", "logic": [{
                    "type": "hidden",
                    "condition": {"type": "async", "asyncFunctionName": "isForeignVat", "pendingValue": true}
                }]}
            ]}))
            .unwrap(),
        )
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_async_condition_uses_pending_value_in_flight() {
    let form = vat_form("DE1");
    assert!(form.field("company").unwrap().hidden);
    assert!(form.is_pending());

    form.settled().await;
    assert!(!form.field("company").unwrap().hidden);

    form.set_value("vat", json!("FR9")).unwrap();
    assert!(form.field("company").unwrap().hidden);
    form.settled().await;
    assert!(form.field("company").unwrap().hidden);
    assert!(!form.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_async_condition_last_request_wins() {
    let form = vat_form("DE1");
    form.settled().await;

    // the slow foreign lookup would land after the German one
    form.set_value("vat", json!("FR9")).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    form.set_value("vat", json!("DE3")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!form.field("company").unwrap().hidden);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!form.field("company").unwrap().hidden);
    assert!(!form.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_async_condition_failure_falls_back() {
    // no successful result yet: the pending value stands
    let form = vat_form("bad");
    form.settled().await;
    assert!(form.field("company").unwrap().hidden);
    assert!(!form.is_pending());

    // with a successful result, failures keep it
    let form = vat_form("DE1");
    form.settled().await;
    form.set_value("vat", json!("bad")).unwrap();
    form.settled().await;
    assert!(!form.field("company").unwrap().hidden);
    assert!(!form.is_pending());
}

/// `checkout` is disabled for restricted countries, checked over HTTP
fn export_form(transport: Arc<MockHttpTransport>) -> Form {
    FormEngine::builder()
        .with_transport(transport)
        .build()
        .build_form(
            serde_json::from_value(json!({"fields": [
                {"key": "country", "value": "US"},
                {"key": "checkout", "logic": [{
                    "type": "disabled",
                    "condition": {
                        "type": "http",
                        "http": {
                            "url": "https://api.example.com/export/restricted",
                            "queryParams": {"country": "formValue.country"}
                        },
                        "responseExpression": "response.restricted",
                        "pendingValue": false
                    }
                }]}
            ]}))
            .unwrap(),
        )
        .unwrap()
}

fn export_transport() -> MockHttpTransport {
    MockHttpTransport::new(|request| {
        if request.url.contains("country=XX") {
            return Err(HttpError::Status {
                status: 500,
                url: request.url.clone(),
            });
        }
        Ok(json!({"restricted": request.url.contains("country=KP")}))
    })
    .with_delay(Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn test_http_condition_pending_then_resolved() {
    let transport = Arc::new(export_transport());
    let form = export_form(transport.clone());
    assert!(form.is_pending());
    assert!(!form.field("checkout").unwrap().disabled);
    form.settled().await;
    assert!(!form.field("checkout").unwrap().disabled);

    form.set_value("country", json!("KP")).unwrap();
    // the pending value applies while the request is in flight
    assert!(!form.field("checkout").unwrap().disabled);
    form.settled().await;
    assert!(form.field("checkout").unwrap().disabled);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_http_condition_last_request_wins() {
    let transport = Arc::new(export_transport());
    let form = export_form(transport.clone());
    form.settled().await;

    form.set_value("country", json!("FR")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    form.set_value("country", json!("KP")).unwrap();
    form.settled().await;

    assert!(transport.requests().last().unwrap().url.contains("country=KP"));
    assert!(form.field("checkout").unwrap().disabled);
    assert!(!form.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_http_condition_failure_keeps_last_good() {
    let transport = Arc::new(export_transport());
    let form = export_form(transport.clone());
    form.settled().await;
    form.set_value("country", json!("KP")).unwrap();
    form.settled().await;
    assert!(form.field("checkout").unwrap().disabled);

    form.set_value("country", json!("XX")).unwrap();
    form.settled().await;
    assert!(form.field("checkout").unwrap().disabled);
    assert!(!form.is_pending());
}
