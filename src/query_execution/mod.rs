use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Instant;
use tokio::time::{timeout, Duration};

use crate::config::QuerySettings;
use crate::connection::ConnectionHandle;
use crate::db_types::{Row, RowSet, SqlDialect};
use crate::security::redact_sensitive_text;

const ROW_NUMBER_COLUMN: &str = "__sqlbridge_rn";
const PAGE_ALIAS: &str = "__sqlbridge_page";
const DISTINCT_ALIAS: &str = "__sqlbridge_distinct";
const DEFAULT_WINDOW_ORDER: &str = "(SELECT NULL)";

static TRAILING_LIMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // LIMIT n | LIMIT m, n | LIMIT n OFFSET m at the end of the statement.
    Regex::new(
        r"(?is)^(?P<body>.*?)\s+limit\s+(?P<first>\d+)(?:\s*,\s*(?P<second>\d+)|\s+offset\s+(?P<offset>\d+))?\s*$",
    )
    .unwrap()
});

static SELECT_HEAD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*select\s+(?:distinct\s+)?").unwrap());

static DISTINCT_HEAD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*select\s+distinct\s+").unwrap());

static QUALIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[a-z_][a-z0-9_]*\.").unwrap());

static TOP_CLAUSE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*select\s+(?:distinct\s+)?top\b").unwrap());

static ALIAS_SUFFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\s+as\s+(?P<alias>[\w\[\]`\x22]+)\s*$").unwrap());

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    EmptyStatement,
    Syntax,
    UnknownColumn,
    UnknownTable,
    PermissionDenied,
    Timeout,
    ConnectionLost,
    Other,
}

impl QueryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyStatement => "empty_statement",
            Self::Syntax => "syntax",
            Self::UnknownColumn => "unknown_column",
            Self::UnknownTable => "unknown_table",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection_lost",
            Self::Other => "other",
        }
    }

    /// Maps driver error text onto a kind.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

        if has(&[
            "connection reset",
            "broken pipe",
            "connection closed",
            "connection is closed",
            "connection lost",
            "communication link failure",
            "server has gone away",
            "unexpected eof",
        ]) {
            Self::ConnectionLost
        } else if has(&["timed out", "timeout"]) {
            Self::Timeout
        } else if has(&["invalid column name", "no such column", "unknown column"]) {
            Self::UnknownColumn
        } else if has(&[
            "invalid object name",
            "no such table",
            "unknown table",
            "doesn't exist",
        ]) {
            Self::UnknownTable
        } else if has(&[
            "permission denied",
            "permission was denied",
            "access denied",
            "not authorized",
        ]) {
            Self::PermissionDenied
        } else if has(&["syntax error", "incorrect syntax", "syntax near"]) {
            Self::Syntax
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Query failed ({}): {message}", .kind.as_str())]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

impl QueryError {
    fn new(kind: QueryErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: redact_sensitive_text(message),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub rows: RowSet,
    pub elapsed_ms: u64,
    /// Statement actually sent, when paging was rewritten.
    pub rewritten_sql: Option<String>,
}

pub struct QueryExecutor {
    statement_timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(settings: &QuerySettings) -> Self {
        Self {
            statement_timeout: settings
                .timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    pub async fn execute(
        &self,
        handle: &ConnectionHandle,
        sql: &str,
    ) -> Result<QueryOutput, QueryError> {
        let statement = sql.trim().trim_end_matches(';').trim();
        if statement.is_empty() {
            return Err(QueryError::new(
                QueryErrorKind::EmptyStatement,
                "SQL statement is empty",
            ));
        }

        let rewritten_sql = rewrite_paging(statement, handle.dialect);
        let effective = rewritten_sql.as_deref().unwrap_or(statement);
        if let Some(rewritten) = &rewritten_sql {
            log::debug!(
                "Rewrote paging for '{}': {}",
                handle.profile_id,
                redact_sensitive_text(rewritten)
            );
        }

        let started = Instant::now();
        let result = match self.statement_timeout {
            Some(limit) => match timeout(limit, handle.connection().query(effective)).await {
                Ok(result) => result,
                Err(_) => Err(format!("Query timed out after {} seconds", limit.as_secs())),
            },
            None => handle.connection().query(effective).await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(rows) => {
                let rows = if rewritten_sql.is_some() {
                    drop_row_number_column(rows)
                } else {
                    rows
                };
                log::info!(
                    "Query on '{}' returned {} row(s) in {} ms",
                    handle.profile_id,
                    rows.len(),
                    elapsed_ms
                );
                Ok(QueryOutput {
                    rows,
                    elapsed_ms,
                    rewritten_sql,
                })
            }
            Err(message) => {
                let error = QueryError::new(QueryErrorKind::classify(&message), &message);
                log::warn!(
                    "Query on '{}' failed after {} ms: {}",
                    handle.profile_id,
                    elapsed_ms,
                    error
                );
                Err(error)
            }
        }
    }
}

/// Appends `LIMIT n` unless the statement already ends in a limit clause.
pub fn limit_rows(sql: &str, limit: usize) -> String {
    let statement = sql.trim().trim_end_matches(';').trim();
    if TRAILING_LIMIT_REGEX.is_match(statement) || TOP_CLAUSE_REGEX.is_match(statement) {
        statement.to_string()
    } else {
        format!("{} LIMIT {}", statement, limit)
    }
}

/// Translates a trailing `LIMIT` clause for engines that only know `TOP` and
/// `ROW_NUMBER()`. Returns `None` when the statement is sent unchanged.
pub fn rewrite_paging(sql: &str, dialect: SqlDialect) -> Option<String> {
    if dialect != SqlDialect::TopN {
        return None;
    }

    let caps = TRAILING_LIMIT_REGEX.captures(sql)?;
    let body = caps.name("body")?.as_str().trim();
    let first: u64 = caps.name("first")?.as_str().parse().ok()?;
    let (count, offset) = match (caps.name("second"), caps.name("offset")) {
        (Some(second), _) => (second.as_str().parse().ok()?, first),
        (None, Some(offset)) => (first, offset.as_str().parse().ok()?),
        (None, None) => (first, 0),
    };

    let head = SELECT_HEAD_REGEX.find(body)?;
    if TOP_CLAUSE_REGEX.is_match(body) {
        return None;
    }

    if offset == 0 {
        return Some(format!(
            "{}TOP {} {}",
            head.as_str(),
            count,
            &body[head.end()..]
        ));
    }

    let (without_order, order) = split_trailing_order_by(body);
    let select_list_start = SELECT_HEAD_REGEX.find(without_order)?.end();
    let inner = without_order[select_list_start..].trim();

    // DISTINCT must apply before numbering, so it stays in a derived table
    // and the window runs over its output columns.
    let (numbered_source, order) = if DISTINCT_HEAD_REGEX.is_match(without_order) {
        let order = order
            .map(|order| QUALIFIER_REGEX.replace_all(&order, "").into_owned())
            .or_else(|| first_projected_name(inner));
        (
            format!(
                "{alias}.* FROM (SELECT DISTINCT {inner}) AS {alias}",
                alias = DISTINCT_ALIAS,
                inner = inner
            ),
            order,
        )
    } else {
        let order = order.or_else(|| first_projected_column(inner));
        (inner.to_string(), order)
    };
    let order = order.unwrap_or_else(|| DEFAULT_WINDOW_ORDER.to_string());

    Some(format!(
        "SELECT * FROM (SELECT ROW_NUMBER() OVER (ORDER BY {order}) AS {rn}, {source}) AS {page} WHERE {rn} > {lower} AND {rn} <= {upper} ORDER BY {rn}",
        order = order,
        rn = ROW_NUMBER_COLUMN,
        source = numbered_source,
        page = PAGE_ALIAS,
        lower = offset,
        upper = offset + count,
    ))
}

/// Splits off the last ORDER BY at nesting depth zero.
fn split_trailing_order_by(body: &str) -> (&str, Option<String>) {
    let lower = body.to_ascii_lowercase();
    for &pos in top_level_keyword_positions(body, "order").iter().rev() {
        let rest = &lower[pos + "order".len()..];
        let trimmed = rest.trim_start();
        let gap = rest.len() - trimmed.len();
        let by_follows = gap > 0
            && trimmed.starts_with("by")
            && !trimmed[2..].starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_');
        if !by_follows {
            continue;
        }
        let order_start = pos + "order".len() + gap + 2;
        let order = body[order_start..].trim();
        if order.is_empty() {
            return (body, None);
        }
        return (body[..pos].trim_end(), Some(order.to_string()));
    }
    (body, None)
}

/// Output name of the first projected column: its alias, or the column
/// without its table qualifier.
fn first_projected_name(select_tail: &str) -> Option<String> {
    let first = first_projection_item(select_tail)?;
    match ALIAS_SUFFIX_REGEX.captures(&first) {
        Some(caps) => caps.name("alias").map(|alias| alias.as_str().to_string()),
        None => Some(QUALIFIER_REGEX.replace_all(&first, "").into_owned()),
    }
}

fn first_projected_column(select_tail: &str) -> Option<String> {
    let first = first_projection_item(select_tail)?;
    let first = ALIAS_SUFFIX_REGEX.replace(&first, "");
    let first = first.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

fn first_projection_item(select_tail: &str) -> Option<String> {
    let from = top_level_keyword_positions(select_tail, "from")
        .first()
        .copied()
        .unwrap_or(select_tail.len());
    let projection = &select_tail[..from];

    let mut depth = 0i32;
    let mut end = projection.len();
    for (i, c) in projection.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }

    let first = projection[..end].trim();
    if first.is_empty() || first == "*" || first.ends_with(".*") {
        None
    } else {
        Some(first.to_string())
    }
}

/// Byte offsets of `keyword` (lowercase, space separated) outside parentheses
/// and quoted literals.
fn top_level_keyword_positions(sql: &str, keyword: &str) -> Vec<usize> {
    let lower = sql.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let needle = keyword.as_bytes();
    let mut positions = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'[' => quote = Some(b']'),
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {
                if depth == 0 && bytes[i..].starts_with(needle) {
                    let before_ok = i == 0 || !is_word_byte(bytes[i - 1]);
                    let after = i + needle.len();
                    let after_ok = after >= bytes.len() || !is_word_byte(bytes[after]);
                    if before_ok && after_ok {
                        positions.push(i);
                        i = after;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }

    positions
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn drop_row_number_column(rows: RowSet) -> RowSet {
    let columns = rows
        .columns
        .into_iter()
        .filter(|column| !column.eq_ignore_ascii_case(ROW_NUMBER_COLUMN))
        .collect();
    let rows = rows
        .rows
        .into_iter()
        .map(|row| {
            row.iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case(ROW_NUMBER_COLUMN))
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect::<Row>()
        })
        .collect();
    RowSet::new(columns, rows)
}
