//! Rule engine benchmarks
//!
//! Measures the hot paths of a live form:
//! - expression parsing and evaluation
//! - dependency extraction and classification
//! - rule collection over array-heavy configurations
//! - propagation of a single user edit

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use octofhir_formrules::{
    EngineConfig, EvaluationScope, FormConfig, FormEngine, extract_expression_dependencies, parse,
};
use serde_json::{Value, json};
use std::hint::black_box;

const TEST_EXPRESSIONS: &[(&str, &str)] = &[
    ("simple", "fieldValue > 18"),
    ("member", "formValue.address.country == 'US'"),
    (
        "arithmetic",
        "formValue.quantity * formValue.unitPrice - formValue.discount",
    ),
    (
        "methods",
        "formValue.email.toLowerCase().endsWith('@example.com') && formValue.age >= 21",
    ),
    (
        "indexed",
        "formValue.items[$index].quantity * formValue.items[$index].price",
    ),
];

fn order_form(items: usize) -> Value {
    let rows: Vec<Value> = (0..items)
        .map(|i| json!({"quantity": i % 7 + 1, "price": 10 + i % 13}))
        .collect();
    json!({
        "fields": [
            {"key": "customer", "validators": [{"type": "required"}]},
            {"key": "email", "validators": [{"type": "email"}]},
            {"key": "discount", "value": 0},
            {"key": "items", "type": "array", "value": rows, "template": [
                {"key": "quantity", "validators": [{"type": "min", "value": 1}]},
                {"key": "price", "logic": [{
                    "type": "readonly",
                    "condition": {"type": "fieldValue", "fieldPath": "discount",
                                  "operator": "greater", "value": 50}
                }]},
                {"key": "lineTotal", "logic": [{
                    "type": "derivation",
                    "expression": "formValue.items[$index].quantity * formValue.items[$index].price"
                }]}
            ]},
            {"key": "note", "logic": [{
                "type": "hidden",
                "condition": {"type": "javascript",
                              "expression": "formValue.discount == 0"}
            }]}
        ]
    })
}

fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");
    group.throughput(Throughput::Elements(1));

    for (name, expression) in TEST_EXPRESSIONS {
        group.bench_with_input(BenchmarkId::new("parse", name), expression, |b, expr| {
            b.iter(|| black_box(parse(black_box(expr))))
        });
    }

    group.finish();
}

fn bench_evaluator(c: &mut Criterion) {
    let engine = FormEngine::new();
    let form = json!({
        "address": {"country": "US"},
        "quantity": 4,
        "unitPrice": 12.5,
        "discount": 3,
        "email": "Someone@Example.com",
        "age": 30,
        "items": [{"quantity": 2, "price": 7}]
    });
    let field_value = json!(42);
    let scope = EvaluationScope::new(&field_value, &form).with_index(Some(0));

    let mut group = c.benchmark_group("evaluator");
    for (name, expression) in TEST_EXPRESSIONS {
        group.bench_with_input(BenchmarkId::new("cached", name), expression, |b, expr| {
            b.iter(|| black_box(engine.evaluator().evaluate_source(black_box(expr), &scope)))
        });
    }
    group.finish();
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");
    for (name, expression) in TEST_EXPRESSIONS {
        group.bench_with_input(BenchmarkId::new("dependencies", name), expression, |b, expr| {
            b.iter(|| black_box(extract_expression_dependencies(black_box(expr))))
        });
    }
    group.finish();
}

fn bench_collect(c: &mut Criterion) {
    let engine = FormEngine::new();
    let mut group = c.benchmark_group("collect");

    for items in [1usize, 10, 100] {
        let config = FormConfig::from_value(order_form(items)).unwrap();
        group.bench_with_input(BenchmarkId::new("template", items), &config, |b, config| {
            b.iter(|| black_box(engine.collect(black_box(config))))
        });
        group.bench_with_input(BenchmarkId::new("build_form", items), &config, |b, config| {
            b.iter(|| black_box(engine.build_form(config.clone())))
        });
    }

    group.finish();
}

fn bench_propagation(c: &mut Criterion) {
    let engine = FormEngine::builder()
        .with_config(EngineConfig::testing())
        .build();
    let mut group = c.benchmark_group("propagation");

    for items in [10usize, 100] {
        let form = engine
            .build_form(FormConfig::from_value(order_form(items)).unwrap())
            .unwrap();
        let mut discount = 0;
        group.bench_function(BenchmarkId::new("set_value", items), |b| {
            b.iter(|| {
                discount = (discount + 37) % 100;
                black_box(form.set_value("discount", json!(discount)))
            })
        });
        group.bench_function(BenchmarkId::new("row_edit", items), |b| {
            b.iter(|| black_box(form.set_value("items.0.quantity", json!(discount % 5 + 1))))
        });
    }

    group.finish();
}

criterion_group!(
    rule_engine_benchmarks,
    bench_parser,
    bench_evaluator,
    bench_analysis,
    bench_collect,
    bench_propagation
);

criterion_main!(rule_engine_benchmarks);
