//! Output formatting: aggregates step results into JSON, CSV, or a prose
//! summary.
//!
//! Products are collected across all successful step results by probing the
//! `extracted` / `products` / `ranked` keys, recursing into nested
//! `response` values, deduplicated by `(name, source)`, and sorted by
//! rating (descending) then price (ascending).

use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::{Value, json};

use courier_store::models::{Action, OutputFormat, Plan};

/// Render the final output for a finished plan.
pub fn format_output(plan: &Plan, format: OutputFormat) -> Value {
    let products = collect_products(plan);

    match format {
        OutputFormat::Json => as_json(plan, products),
        OutputFormat::Csv => Value::String(as_csv(products)),
        OutputFormat::Summary => Value::String(as_summary(plan, products)),
    }
}

/// Pull product objects out of every step result.
fn collect_products(plan: &Plan) -> Vec<Value> {
    let mut products: Vec<Value> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for step in &plan.steps {
        if let Some(result) = &step.result {
            probe(result, &mut products, &mut seen);
        }
    }

    sort_products(&mut products);
    products
}

fn probe(value: &Value, products: &mut Vec<Value>, seen: &mut HashSet<String>) {
    let Some(obj) = value.as_object() else {
        return;
    };

    for key in ["extracted", "products", "ranked"] {
        if let Some(items) = obj.get(key).and_then(Value::as_array) {
            for item in items {
                let name = item.get("name").and_then(Value::as_str).unwrap_or("");
                let source = item.get("source").and_then(Value::as_str).unwrap_or("");
                let ident = format!("{name}-{source}");
                if seen.insert(ident) {
                    products.push(item.clone());
                }
            }
        }
    }

    if let Some(nested) = obj.get("response") {
        probe(nested, products, seen);
    }
}

fn num(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn sort_products(products: &mut [Value]) {
    products.sort_by(|a, b| {
        num(b, "rating")
            .partial_cmp(&num(a, "rating"))
            .unwrap_or(Ordering::Equal)
            .then(
                num(a, "price")
                    .partial_cmp(&num(b, "price"))
                    .unwrap_or(Ordering::Equal),
            )
    });
}

/// The last summarize step's summary (or recommendation) text, if any.
fn summary_text(plan: &Plan) -> Option<String> {
    let result = plan
        .steps
        .iter()
        .rev()
        .find(|s| s.action == Action::Summarize)
        .and_then(|s| s.result.as_ref())?;

    let response = result.get("response").unwrap_or(result);
    response
        .get("summary")
        .or_else(|| response.get("recommendation"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn as_json(plan: &Plan, products: Vec<Value>) -> Value {
    json!({
        "command": plan.command,
        "total_results": products.len(),
        "results": products,
        "summary": summary_text(plan),
    })
}

/// Render a cell for CSV or the prose summary. Numbers print bare, strings
/// as-is, anything missing as the given fallback.
fn display_field<'a>(product: &'a Value, key: &str, fallback: &'a str) -> String {
    match product.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => fallback.to_string(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn as_csv(products: Vec<Value>) -> String {
    if products.is_empty() {
        return "No results found.".to_string();
    }

    let mut out = String::from("name,price,rating,source\n");
    for p in &products {
        let row = [
            display_field(p, "name", ""),
            display_field(p, "price", ""),
            display_field(p, "rating", ""),
            display_field(p, "source", ""),
        ];
        out.push_str(
            &row.iter()
                .map(|f| csv_escape(f))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    out
}

fn as_summary(plan: &Plan, products: Vec<Value>) -> String {
    if products.is_empty() {
        return "No results were found for your query.".to_string();
    }

    let mut lines: Vec<String> = vec![format!("Results for: {}", plan.command), String::new()];

    for (i, p) in products.iter().take(10).enumerate() {
        lines.push(format!(
            "{}. {} — ${} ({} stars) from {}",
            i + 1,
            display_field(p, "name", "Unknown"),
            display_field(p, "price", "?"),
            display_field(p, "rating", "?"),
            display_field(p, "source", "unknown"),
        ));
    }

    if let Some(summary) = summary_text(plan) {
        lines.push(String::new());
        lines.push(summary);
    }

    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::models::Step;

    fn plan_with_results() -> Plan {
        let mut extract_a = Step::new(Action::Extract, "https://www.a.com", "Extract", "a", vec![]);
        extract_a.mark_completed(json!({
            "success": true,
            "response": {
                "extracted": [
                    {"name": "X", "price": 100, "rating": 4.5, "source": "a"},
                    {"name": "Y", "price": 90, "rating": 4.5, "source": "a"},
                ],
            },
        }));

        let mut extract_b = Step::new(Action::Extract, "https://www.a.com", "Extract", "a", vec![]);
        extract_b.mark_completed(json!({
            "success": true,
            "response": {
                "extracted": [
                    {"name": "X", "price": 100, "rating": 4.5, "source": "a"},
                ],
            },
        }));

        let mut summarize = Step::new(Action::Summarize, "aggregated", "Summarize", "s", vec![]);
        summarize.mark_completed(json!({
            "success": true,
            "response": {"summary": "Y is the best value."},
        }));

        Plan::new("t1", "find widgets", vec![extract_a, extract_b, summarize])
    }

    #[test]
    fn json_output_dedups_and_sorts() {
        let plan = plan_with_results();
        let out = format_output(&plan, OutputFormat::Json);

        assert_eq!(out["command"], "find widgets");
        assert_eq!(out["total_results"], 2);
        // Equal ratings: cheaper first.
        assert_eq!(out["results"][0]["name"], "Y");
        assert_eq!(out["results"][1]["name"], "X");
        assert_eq!(out["summary"], "Y is the best value.");
    }

    #[test]
    fn csv_output_has_header_and_rows() {
        let plan = plan_with_results();
        let out = format_output(&plan, OutputFormat::Csv);
        let text = out.as_str().unwrap();

        assert!(text.starts_with("name,price,rating,source\n"));
        let lines: Vec<&str> = text.trim_end().lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "Y,90,4.5,a");
        assert_eq!(lines[2], "X,100,4.5,a");
    }

    #[test]
    fn csv_empty_set() {
        let plan = Plan::new("t1", "find nothing", vec![]);
        let out = format_output(&plan, OutputFormat::Csv);
        assert_eq!(out.as_str().unwrap(), "No results found.");
    }

    #[test]
    fn csv_escapes_commas_in_names() {
        let mut step = Step::new(Action::Extract, "https://www.a.com", "Extract", "a", vec![]);
        step.mark_completed(json!({
            "response": {"extracted": [
                {"name": "Widget, Deluxe", "price": 5, "rating": 3.0, "source": "a"},
            ]},
        }));
        let plan = Plan::new("t1", "cmd", vec![step]);

        let out = format_output(&plan, OutputFormat::Csv);
        assert!(out.as_str().unwrap().contains("\"Widget, Deluxe\""));
    }

    #[test]
    fn summary_output_format() {
        let plan = plan_with_results();
        let out = format_output(&plan, OutputFormat::Summary);
        let text = out.as_str().unwrap();

        assert!(text.starts_with("Results for: find widgets\n\n1. Y — $90 (4.5 stars) from a"));
        assert!(text.contains("2. X — $100 (4.5 stars) from a"));
        assert!(text.ends_with("Y is the best value."));
    }

    #[test]
    fn summary_empty_set() {
        let plan = Plan::new("t1", "find nothing", vec![]);
        let out = format_output(&plan, OutputFormat::Summary);
        assert_eq!(out.as_str().unwrap(), "No results were found for your query.");
    }

    #[test]
    fn summary_caps_at_ten_products() {
        let items: Vec<Value> = (0..15)
            .map(|i| json!({"name": format!("P{i}"), "price": i, "rating": 4.0, "source": "s"}))
            .collect();
        let mut step = Step::new(Action::Extract, "https://www.a.com", "Extract", "a", vec![]);
        step.mark_completed(json!({"response": {"extracted": items}}));
        let plan = Plan::new("t1", "cmd", vec![step]);

        let out = format_output(&plan, OutputFormat::Summary);
        let text = out.as_str().unwrap();
        assert!(text.contains("10. "));
        assert!(!text.contains("11. "));
    }

    #[test]
    fn collects_from_top_level_and_nested_response() {
        let mut top = Step::new(Action::Search, "https://www.a.com", "Search", "a", vec![]);
        top.mark_completed(json!({
            "products": [{"name": "Top", "price": 1, "rating": 1.0, "source": "t"}],
        }));
        let mut nested = Step::new(Action::Compare, "aggregated", "Compare", "s", vec![]);
        nested.mark_completed(json!({
            "response": {"ranked": [{"name": "Nested", "price": 2, "rating": 2.0, "source": "n"}]},
        }));
        let plan = Plan::new("t1", "cmd", vec![top, nested]);

        let out = format_output(&plan, OutputFormat::Json);
        assert_eq!(out["total_results"], 2);
    }

    #[test]
    fn summary_prefers_last_summarize_step() {
        let mut first = Step::new(Action::Summarize, "aggregated", "Summarize", "s", vec![]);
        first.mark_completed(json!({"response": {"summary": "old"}}));
        let mut second = Step::new(Action::Summarize, "aggregated", "Summarize", "s", vec![]);
        second.mark_completed(json!({"response": {"recommendation": "new"}}));
        let plan = Plan::new("t1", "cmd", vec![first, second]);

        assert_eq!(summary_text(&plan).as_deref(), Some("new"));
    }

    #[test]
    fn failed_steps_contribute_nothing() {
        let mut failed = Step::new(Action::Extract, "https://www.a.com", "Extract", "a", vec![]);
        failed.mark_failed("boom");
        let plan = Plan::new("t1", "cmd", vec![failed]);

        let out = format_output(&plan, OutputFormat::Json);
        assert_eq!(out["total_results"], 0);
    }
}
