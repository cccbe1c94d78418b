//! Built-in decomposition rules.

use super::{RuleFn, SubtaskSpec};
use crate::core::task::Params;
use serde_json::{json, Value};

const SCOPE_KEYS: [&str; 3] = ["category", "start_date", "end_date"];

/// All built-in rules, keyed by the request type they handle.
pub fn builtin_rules() -> Vec<(&'static str, RuleFn)> {
    vec![
        ("comprehensive_analysis", Box::new(comprehensive_analysis) as RuleFn),
        ("market_trend", Box::new(market_trend) as RuleFn),
        ("competitor_report", Box::new(competitor_report) as RuleFn),
        ("strategy_review", Box::new(strategy_review) as RuleFn),
    ]
}

/// Copy the request's scope keys that are present.
fn scope(params: &Params) -> Params {
    SCOPE_KEYS
        .iter()
        .filter_map(|key| params.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

fn with(mut base: Params, entries: &[(&str, Value)]) -> Params {
    for (key, value) in entries {
        base.insert(key.to_string(), value.clone());
    }
    base
}

/// Four independent analyses over the same scope.
fn comprehensive_analysis(params: &Params) -> Vec<SubtaskSpec> {
    let base = scope(params);
    vec![
        SubtaskSpec::new("market", "market_analysis").with_params(with(
            base.clone(),
            &[("metrics", json!(["sales", "volume", "market_share"]))],
        )),
        SubtaskSpec::new("selling_points", "selling_point_analysis").with_params(base.clone()),
        SubtaskSpec::new("competitors", "competitor_analysis").with_params(base.clone()),
        SubtaskSpec::new("pricing", "price_analysis").with_params(base),
    ]
}

/// Collect, analyse, then derive insights.
fn staged_pipeline(
    params: &Params,
    data_types: Value,
    collect_capability: &str,
    methods: Value,
    dimensions: Value,
    analysis_capability: &str,
    insight_types: Value,
) -> Vec<SubtaskSpec> {
    let collect = with(
        scope(params),
        &[
            ("time_range", params.get("time_range").cloned().unwrap_or(Value::Null)),
            ("data_types", data_types),
        ],
    );
    let analyse = with(
        Params::new(),
        &[("analysis_methods", methods), ("dimensions", dimensions)],
    );
    let insights = with(
        Params::new(),
        &[("insight_types", insight_types), ("max_insights", json!(5))],
    );

    vec![
        SubtaskSpec::new("collect", "data_collection")
            .with_params(collect)
            .with_capability(collect_capability),
        SubtaskSpec::new("analyse", "data_analysis")
            .with_params(analyse)
            .with_capability(analysis_capability)
            .after(&["collect"]),
        SubtaskSpec::new("insights", "insight_generation")
            .with_params(insights)
            .with_capability("business_strategy")
            .after(&["analyse"]),
    ]
}

fn market_trend(params: &Params) -> Vec<SubtaskSpec> {
    staged_pipeline(
        params,
        json!(["market_data", "sales_data"]),
        "market_data",
        json!(["trend_analysis", "seasonality_analysis"]),
        json!(["sales", "market_share", "growth_rate"]),
        "market_analysis",
        json!(["trend_insights", "opportunity_insights", "risk_insights"]),
    )
}

fn competitor_report(params: &Params) -> Vec<SubtaskSpec> {
    staged_pipeline(
        params,
        json!(["competitor_data", "product_data"]),
        "competitor_data",
        json!(["comparative_analysis", "gap_analysis"]),
        json!(["price", "features", "market_position"]),
        "competitor_analysis",
        json!(["competitive_advantage", "threat_insights", "opportunity_insights"]),
    )
}

/// Two nested pipelines followed by a summary that needs both.
fn strategy_review(params: &Params) -> Vec<SubtaskSpec> {
    let base = scope(params);
    vec![
        SubtaskSpec::new("market", "market_trend").with_params(base.clone()),
        SubtaskSpec::new("competitors", "competitor_report").with_params(base.clone()),
        SubtaskSpec::new("summary", "executive_summary")
            .with_params(base)
            .with_capability("business_strategy")
            .after(&["market", "competitors"]),
    ]
}
