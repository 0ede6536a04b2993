use crate::models::ConnectionProfile;
use serde::{Deserialize, Serialize};

/// Ways of turning a profile into a connection string, tried in configured order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStrategy {
    ExplicitString,
    DataSourceName,
    ProviderQualified,
    DriverServerPort,
    DriverAlternateFields,
    DriverDataSourceCatalog,
}

pub const DEFAULT_STRATEGY_ORDER: [ConnectionStrategy; 6] = [
    ConnectionStrategy::ExplicitString,
    ConnectionStrategy::DataSourceName,
    ConnectionStrategy::ProviderQualified,
    ConnectionStrategy::DriverServerPort,
    ConnectionStrategy::DriverAlternateFields,
    ConnectionStrategy::DriverDataSourceCatalog,
];

impl ConnectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitString => "explicit_string",
            Self::DataSourceName => "data_source_name",
            Self::ProviderQualified => "provider_qualified",
            Self::DriverServerPort => "driver_server_port",
            Self::DriverAlternateFields => "driver_alternate_fields",
            Self::DriverDataSourceCatalog => "driver_data_source_catalog",
        }
    }

    /// Connection string for `profile`, or `None` when the profile lacks what
    /// this strategy needs.
    pub fn build(&self, profile: &ConnectionProfile) -> Option<String> {
        let driver = profile.driver.trim();
        let host = profile.host.trim();
        let generated_ok = !driver.is_empty() && !host.is_empty();
        let user = profile.username.as_str();
        let password = profile.password_or_empty();

        let segments: Vec<(&str, String)> = match self {
            Self::ExplicitString => {
                return profile
                    .connection_string
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string);
            }
            Self::DataSourceName => {
                let alias = profile.dsn.as_deref().map(str::trim).unwrap_or("");
                if alias.is_empty() {
                    return None;
                }
                vec![
                    ("DSN", alias.to_string()),
                    ("UID", user.to_string()),
                    ("PWD", password.to_string()),
                ]
            }
            Self::ProviderQualified if generated_ok => vec![
                ("Provider", "MSDASQL".to_string()),
                ("Driver", braced(driver)),
                ("Server", host_with_port(host, profile.port)),
                ("Database", profile.database.clone()),
                ("UID", user.to_string()),
                ("PWD", password.to_string()),
            ],
            Self::DriverServerPort if generated_ok => vec![
                ("Driver", braced(driver)),
                ("Server", host.to_string()),
                ("Port", port_text(profile.port)),
                ("Database", profile.database.clone()),
                ("UID", user.to_string()),
                ("PWD", password.to_string()),
            ],
            Self::DriverAlternateFields if generated_ok => vec![
                ("Driver", braced(driver)),
                ("Host", host.to_string()),
                ("Port", port_text(profile.port)),
                ("DB", profile.database.clone()),
                ("User", user.to_string()),
                ("Password", password.to_string()),
            ],
            Self::DriverDataSourceCatalog if generated_ok => vec![
                ("Driver", braced(driver)),
                ("Data Source", host_with_port(host, profile.port)),
                ("Initial Catalog", profile.database.clone()),
                ("User ID", user.to_string()),
                ("Password", password.to_string()),
            ],
            _ => return None,
        };

        let mut parts: Vec<String> = segments
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{}={}", key, quote_value(&value)))
            .collect();
        parts.extend(
            profile
                .extra_params
                .iter()
                .map(|(key, value)| format!("{}={}", key, quote_value(value))),
        );
        Some(parts.join(";"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCandidate {
    pub strategy: ConnectionStrategy,
    pub connection_string: String,
}

/// Ordered, de-duplicated candidates for `profile`.
pub fn build_candidates(
    profile: &ConnectionProfile,
    strategies: &[ConnectionStrategy],
) -> Vec<ConnectionCandidate> {
    let mut candidates: Vec<ConnectionCandidate> = Vec::new();
    for strategy in strategies {
        let Some(connection_string) = strategy.build(profile) else {
            continue;
        };
        let duplicate = candidates.iter().any(|existing| {
            existing.strategy == *strategy || existing.connection_string == connection_string
        });
        if !duplicate {
            candidates.push(ConnectionCandidate {
                strategy: *strategy,
                connection_string,
            });
        }
    }
    candidates
}

fn braced(value: &str) -> String {
    if value.starts_with('{') && value.ends_with('}') {
        value.to_string()
    } else {
        format!("{{{}}}", value)
    }
}

fn host_with_port(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{},{}", host, port),
        None => host.to_string(),
    }
}

fn port_text(port: Option<u16>) -> String {
    port.map(|p| p.to_string()).unwrap_or_default()
}

/// Braces values the parser would otherwise split. A `}` inside braces is
/// written as `}}`.
fn quote_value(value: &str) -> String {
    let already_braced = value.len() >= 2
        && value.starts_with('{')
        && value.ends_with('}')
        && !value[1..value.len() - 1].contains('}');
    if already_braced {
        return value.to_string();
    }
    if value.contains([';', '=', '}']) || value.starts_with('{') {
        format!("{{{}}}", value.replace('}', "}}"))
    } else {
        value.to_string()
    }
}
