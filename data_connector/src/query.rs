//! Query translation from the abstract `[field, operator, value]` predicate to
//! each provider's native filter construct.
//!
//! The mapping is total over the five supported operators for all providers.
//! Anything that cannot be mapped fails with `UNSUPPORTED_OPERATOR` instead of
//! being dropped, because a dropped predicate turns a filtered read into an
//! unfiltered one.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    core::Provider,
    error::{ConnectorResult, NormalizedError, CONNECTOR_PROVIDER_LABEL, UNSUPPORTED_OPERATOR},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
}

impl Operator {
    pub const ALL: [Operator; 5] = [
        Operator::Eq,
        Operator::Gt,
        Operator::Lt,
        Operator::Gte,
        Operator::Lte,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = NormalizedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| {
                NormalizedError::new(
                    UNSUPPORTED_OPERATOR,
                    format!("unsupported operator: {s}"),
                    CONNECTOR_PROVIDER_LABEL,
                )
                .with_context("operator", s)
            })
    }
}

/// A single `(field, operator, value)` filter condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPredicate {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl QueryPredicate {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Parse the textual operator form, e.g. `("state", "==", "CA")`.
    pub fn parse(
        field: impl Into<String>,
        op: &str,
        value: impl Into<Value>,
    ) -> ConnectorResult<Self> {
        Ok(Self::new(field, op.parse()?, value))
    }

    pub(crate) fn to_json(&self) -> Value {
        json!([self.field, self.op.as_str(), self.value])
    }
}

/// Provider-native filter produced by [`translate`]
#[derive(Debug, Clone, PartialEq)]
pub enum NativeFilter {
    /// Query-string parameters for the document store
    /// (`orderBy` plus one of `equalTo`/`startAt`/`startAfter`/`endAt`/`endBefore`).
    DocumentParams(Vec<(String, String)>),
    /// PostgREST horizontal filter: `column=op.value`
    RestFilter { column: String, expr: String },
    /// SQL `WHERE` clause with literals already quoted
    SqlWhere(String),
}

/// Translate a predicate into the target provider's native filter.
pub fn translate(predicate: &QueryPredicate, provider: Provider) -> ConnectorResult<NativeFilter> {
    check_literal(predicate, provider)?;
    if predicate.field.is_empty() {
        return Err(
            NormalizedError::unsupported_operator(provider, "predicate field must not be empty")
                .with_context("query", predicate.to_json()),
        );
    }

    let filter = match provider {
        Provider::PushAuthStore => document_params(predicate),
        Provider::ChannelRealtimeStore => rest_filter(predicate),
        Provider::PollingRestStore => NativeFilter::SqlWhere(sql_where(predicate)),
    };
    Ok(filter)
}

/// Only string and number literals are supported; no type guessing.
fn check_literal(predicate: &QueryPredicate, provider: Provider) -> ConnectorResult<()> {
    match &predicate.value {
        Value::String(_) | Value::Number(_) => Ok(()),
        other => Err(NormalizedError::unsupported_operator(
            provider,
            format!(
                "unsupported literal for '{}' {}: only strings and numbers are allowed",
                predicate.field, predicate.op
            ),
        )
        .with_context("query", predicate.to_json())
        .with_context("literal_type", literal_type(other))),
    }
}

fn literal_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn document_params(predicate: &QueryPredicate) -> NativeFilter {
    let param = match predicate.op {
        Operator::Eq => "equalTo",
        Operator::Gt => "startAfter",
        Operator::Lt => "endBefore",
        Operator::Gte => "startAt",
        Operator::Lte => "endAt",
    };
    // The document store expects JSON-encoded parameter values.
    NativeFilter::DocumentParams(vec![
        ("orderBy".to_string(), Value::String(predicate.field.clone()).to_string()),
        (param.to_string(), predicate.value.to_string()),
    ])
}

fn rest_filter(predicate: &QueryPredicate) -> NativeFilter {
    let op = match predicate.op {
        Operator::Eq => "eq",
        Operator::Gt => "gt",
        Operator::Lt => "lt",
        Operator::Gte => "gte",
        Operator::Lte => "lte",
    };
    let literal = match &predicate.value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    NativeFilter::RestFilter {
        column: predicate.field.clone(),
        expr: format!("{op}.{literal}"),
    }
}

fn sql_where(predicate: &QueryPredicate) -> String {
    let op = match predicate.op {
        Operator::Eq => "=",
        Operator::Gt => ">",
        Operator::Lt => "<",
        Operator::Gte => ">=",
        Operator::Lte => "<=",
    };
    format!(
        "c[{}] {op} {}",
        quote_sql_string(&predicate.field),
        sql_literal(&predicate.value)
    )
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::String(s) => quote_sql_string(s),
        other => other.to_string(),
    }
}

fn quote_sql_string(raw: &str) -> String {
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}
