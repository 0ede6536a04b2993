// =====================================================
// TRANSFORMATION ENGINE
// Reshapes source rows according to a column mapping
// =====================================================

use crate::db_types::{CellValue, Row, RowSet};
use crate::models::{ColumnMapping, ColumnRule, ConcatPart, MathOperation, TransformKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

const TRUTHY_VALUES: &[&str] = &["true", "sim", "s", "yes", "y", "1"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

// --- Validation ---

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MappingProblem {
    EmptyTarget,
    DuplicateTarget,
    MissingParams,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MappingIssue {
    pub problem: MappingProblem,
    pub target: String,
    pub sources: Vec<String>,
    pub detail: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Column mapping '{mapping_id}' is invalid: {}", describe_issues(.issues))]
pub struct TransformationError {
    pub mapping_id: String,
    pub issues: Vec<MappingIssue>,
}

fn describe_issues(issues: &[MappingIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.detail.clone())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Save-time check: included targets are non-empty and unique, and rules
/// carry the parameters their kind needs. Every offending rule is reported.
pub fn validate_mapping(mapping: &ColumnMapping) -> Result<(), TransformationError> {
    let mut issues = Vec::new();
    let mut by_target: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for rule in mapping.included() {
        let target = rule.target.trim();
        if target.is_empty() {
            issues.push(MappingIssue {
                problem: MappingProblem::EmptyTarget,
                target: String::new(),
                sources: vec![rule.source.clone()],
                detail: format!("column '{}' has an empty target name", rule.source),
            });
        } else {
            by_target.entry(target).or_default().push(rule.source.as_str());
        }

        if let Some(detail) = missing_params(rule) {
            issues.push(MappingIssue {
                problem: MappingProblem::MissingParams,
                target: target.to_string(),
                sources: vec![rule.source.clone()],
                detail,
            });
        }
    }

    for (target, sources) in by_target {
        if sources.len() > 1 {
            issues.push(MappingIssue {
                problem: MappingProblem::DuplicateTarget,
                target: target.to_string(),
                sources: sources.iter().map(|s| s.to_string()).collect(),
                detail: format!(
                    "target '{}' is produced by more than one column ({})",
                    target,
                    sources.join(", ")
                ),
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(TransformationError {
            mapping_id: mapping.id.clone(),
            issues,
        })
    }
}

fn missing_params(rule: &ColumnRule) -> Option<String> {
    match rule.kind {
        TransformKind::Math => match &rule.params.math {
            Some(math) if !math.operand_field.trim().is_empty() => None,
            _ => Some(format!(
                "math rule for '{}' needs an operand field",
                rule.source
            )),
        },
        TransformKind::Replace => match &rule.params.replace {
            Some(replace) if !replace.pattern.is_empty() => None,
            _ => Some(format!(
                "replace rule for '{}' needs a pattern",
                rule.source
            )),
        },
        TransformKind::Concat if rule.params.concat.iter().any(|p| p.field.trim().is_empty()) => {
            Some(format!(
                "concat rule for '{}' has a part without a field",
                rule.source
            ))
        }
        _ => None,
    }
}

// --- Transformation ---

enum Replacer {
    Pattern(Regex, String),
    Literal(String, String),
}

enum Operation {
    PassThrough,
    Lowercase,
    Uppercase,
    Capitalize,
    Trim,
    Number,
    Boolean,
    Date,
    Concat(Vec<ConcatPart>),
    Math(MathOperation, String),
    Replace(Replacer),
}

struct CompiledRule {
    source: String,
    target: String,
    operation: Operation,
}

fn compile(mapping: &ColumnMapping) -> Vec<CompiledRule> {
    mapping
        .included()
        .map(|rule| CompiledRule {
            source: rule.source.clone(),
            target: rule.target.clone(),
            operation: compile_operation(rule),
        })
        .collect()
}

fn compile_operation(rule: &ColumnRule) -> Operation {
    match rule.kind {
        TransformKind::Lowercase => Operation::Lowercase,
        TransformKind::Uppercase => Operation::Uppercase,
        TransformKind::Capitalize => Operation::Capitalize,
        TransformKind::Trim => Operation::Trim,
        TransformKind::Number => Operation::Number,
        TransformKind::Boolean => Operation::Boolean,
        TransformKind::Date => Operation::Date,
        TransformKind::Concat => Operation::Concat(rule.params.concat.clone()),
        TransformKind::Math => match &rule.params.math {
            Some(math) => Operation::Math(math.operation, math.operand_field.clone()),
            None => Operation::PassThrough,
        },
        TransformKind::Replace => match &rule.params.replace {
            Some(params) if !params.pattern.is_empty() => {
                let replacer = match Regex::new(&params.pattern) {
                    Ok(regex) => Replacer::Pattern(regex, params.replacement.clone()),
                    Err(e) => {
                        log::warn!(
                            "Replace pattern for '{}' is not a valid regex ({}), using literal match",
                            rule.source,
                            e
                        );
                        Replacer::Literal(params.pattern.clone(), params.replacement.clone())
                    }
                };
                Operation::Replace(replacer)
            }
            _ => Operation::PassThrough,
        },
        TransformKind::None | TransformKind::Custom => Operation::PassThrough,
        TransformKind::Unrecognized => {
            log::debug!(
                "Unrecognized transform for '{}', passing value through",
                rule.source
            );
            Operation::PassThrough
        }
    }
}

/// Applies `mapping` to every row. Output rows carry exactly the included
/// target names, in mapping order.
pub fn transform(rows: &RowSet, mapping: &ColumnMapping) -> RowSet {
    let rules = compile(mapping);
    let columns: Vec<String> = rules.iter().map(|rule| rule.target.clone()).collect();

    let output = rows
        .rows
        .iter()
        .map(|row| {
            let mut out = Row::with_capacity(rules.len());
            for rule in &rules {
                let value = row.get(&rule.source).cloned().unwrap_or(CellValue::Null);
                out.insert(rule.target.clone(), apply(&rule.operation, value, row));
            }
            out
        })
        .collect();

    RowSet::new(columns, output)
}

/// Transforms at most `limit` rows, for interactive previews.
pub fn preview(rows: &RowSet, mapping: &ColumnMapping, limit: usize) -> RowSet {
    transform(&rows.truncated(limit), mapping)
}

fn apply(operation: &Operation, value: CellValue, row: &Row) -> CellValue {
    match operation {
        Operation::PassThrough => value,
        Operation::Lowercase => map_text(value, |s| s.to_lowercase()),
        Operation::Uppercase => map_text(value, |s| s.to_uppercase()),
        Operation::Capitalize => map_text(value, capitalize),
        Operation::Trim => map_text(value, |s| s.trim().to_string()),
        Operation::Number => CellValue::Number(to_number(&value)),
        Operation::Boolean => CellValue::Bool(to_boolean(&value)),
        Operation::Date => to_date(&value),
        Operation::Concat(parts) => {
            let mut text = value.to_plain_string();
            for part in parts {
                text.push_str(&part.separator);
                if let Some(sibling) = row.get(&part.field) {
                    text.push_str(&sibling.to_plain_string());
                }
            }
            CellValue::Text(text)
        }
        Operation::Math(op, operand_field) => {
            let left = to_number(&value);
            let right = row.get(operand_field).map(to_number).unwrap_or(0.0);
            let result = match op {
                MathOperation::Add => left + right,
                MathOperation::Subtract => left - right,
                MathOperation::Multiply => left * right,
                MathOperation::Divide if right == 0.0 => 0.0,
                MathOperation::Divide => left / right,
            };
            CellValue::Number(if result.is_finite() { result } else { 0.0 })
        }
        Operation::Replace(replacer) => map_text(value, |s| match replacer {
            Replacer::Pattern(regex, replacement) => {
                regex.replace_all(s, replacement.as_str()).into_owned()
            }
            Replacer::Literal(pattern, replacement) => s.replace(pattern.as_str(), replacement),
        }),
    }
}

fn map_text(value: CellValue, f: impl Fn(&str) -> String) -> CellValue {
    match value {
        CellValue::Text(text) => CellValue::Text(f(&text)),
        other => other,
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

fn to_number(value: &CellValue) -> f64 {
    let number = match value {
        CellValue::Integer(v) => *v as f64,
        CellValue::Number(v) => *v,
        CellValue::Bool(v) => {
            if *v {
                1.0
            } else {
                0.0
            }
        }
        CellValue::Text(text) => text.trim().parse::<f64>().unwrap_or(0.0),
        CellValue::Null | CellValue::Timestamp(_) => 0.0,
    };
    if number.is_finite() {
        number
    } else {
        0.0
    }
}

fn to_boolean(value: &CellValue) -> bool {
    match value {
        CellValue::Bool(v) => *v,
        CellValue::Text(text) => {
            let normalized = text.trim().to_lowercase();
            TRUTHY_VALUES.contains(&normalized.as_str())
        }
        CellValue::Integer(v) => *v != 0,
        CellValue::Number(v) => *v != 0.0,
        CellValue::Timestamp(_) => true,
        CellValue::Null => false,
    }
}

fn to_date(value: &CellValue) -> CellValue {
    let parsed = match value {
        CellValue::Timestamp(ts) => Some(*ts),
        CellValue::Text(text) => parse_date_text(text.trim()),
        CellValue::Integer(millis) => DateTime::from_timestamp_millis(*millis),
        CellValue::Number(millis) if millis.is_finite() => {
            DateTime::from_timestamp_millis(*millis as i64)
        }
        _ => None,
    };
    parsed.map(CellValue::Timestamp).unwrap_or(CellValue::Null)
}

fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}
