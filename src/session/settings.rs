use std::collections::BTreeMap;

use crate::error::{sqlstate, PgError, PgResult};
use crate::sql::system::SERVER_VERSION;

struct SettingDefault {
    name: &'static str,
    display: &'static str,
    value: &'static str,
    description: &'static str,
    /// Sent to the client as ParameterStatus whenever it changes.
    reported: bool,
}

const DEFAULTS: &[SettingDefault] = &[
    SettingDefault { name: "application_name", display: "application_name", value: "", description: "Sets the application name to be reported in statistics and logs.", reported: true },
    SettingDefault { name: "client_encoding", display: "client_encoding", value: "UTF8", description: "Sets the client's character set encoding.", reported: true },
    SettingDefault { name: "datestyle", display: "DateStyle", value: "ISO, MDY", description: "Sets the display format for date and time values.", reported: true },
    SettingDefault { name: "default_transaction_isolation", display: "default_transaction_isolation", value: "serializable", description: "Sets the transaction isolation level of each new transaction.", reported: false },
    SettingDefault { name: "extra_float_digits", display: "extra_float_digits", value: "1", description: "Sets the number of digits displayed for floating-point values.", reported: false },
    SettingDefault { name: "integer_datetimes", display: "integer_datetimes", value: "on", description: "Shows whether datetimes are integer based.", reported: true },
    SettingDefault { name: "intervalstyle", display: "IntervalStyle", value: "postgres", description: "Sets the display format for interval values.", reported: true },
    SettingDefault { name: "is_superuser", display: "is_superuser", value: "on", description: "Shows whether the current user is a superuser.", reported: true },
    SettingDefault { name: "max_identifier_length", display: "max_identifier_length", value: "63", description: "Shows the maximum identifier length.", reported: false },
    SettingDefault { name: "search_path", display: "search_path", value: "public", description: "Sets the schema search order for names that are not schema-qualified.", reported: false },
    SettingDefault { name: "server_encoding", display: "server_encoding", value: "UTF8", description: "Shows the server (database) character set encoding.", reported: true },
    SettingDefault { name: "server_version", display: "server_version", value: SERVER_VERSION, description: "Shows the server version.", reported: true },
    SettingDefault { name: "session_authorization", display: "session_authorization", value: "", description: "Sets the session user name.", reported: true },
    SettingDefault { name: "standard_conforming_strings", display: "standard_conforming_strings", value: "on", description: "Causes '...' strings to treat backslashes literally.", reported: true },
    SettingDefault { name: "statement_timeout", display: "statement_timeout", value: "0", description: "Sets the maximum allowed duration of any statement.", reported: false },
    SettingDefault { name: "timezone", display: "TimeZone", value: "UTC", description: "Sets the time zone for displaying and interpreting time stamps.", reported: true },
    SettingDefault { name: "transaction_isolation", display: "transaction_isolation", value: "serializable", description: "Sets the current transaction's isolation level.", reported: false },
];

/// Settings whose value the bridge cannot change.
const READ_ONLY: &[&str] = &[
    "server_version",
    "server_encoding",
    "integer_datetimes",
    "max_identifier_length",
    "is_superuser",
];

fn lookup(name: &str) -> Option<&'static SettingDefault> {
    DEFAULTS.iter().find(|d| d.name == name)
}

/// Per-session `SET`/`SHOW` state.
///
/// Names are case-insensitive. Unknown names are accepted by `SET` (drivers
/// send plenty the bridge has no use for) and remembered, so `SHOW` answers
/// them afterwards; `SHOW` of a name never set fails with `42704`.
#[derive(Clone, Debug)]
pub struct Settings {
    session: BTreeMap<String, String>,
    /// `SET LOCAL` values, dropped when the transaction ends.
    local: BTreeMap<String, String>,
    user: String,
}

impl Settings {
    pub fn new(user: &str, startup: &[(String, String)]) -> Self {
        let mut settings = Self {
            session: BTreeMap::new(),
            local: BTreeMap::new(),
            user: user.to_string(),
        };
        for (name, value) in startup {
            let name = name.to_ascii_lowercase();
            if matches!(name.as_str(), "user" | "database" | "options" | "replication") {
                continue;
            }
            if let Err(err) = settings.set(&name, Some(value.clone()), false) {
                tracing::debug!(setting = %name, error = %err, "ignoring startup parameter");
            }
        }
        settings
    }

    fn default_value(&self, name: &str) -> Option<String> {
        match name {
            "session_authorization" => Some(self.user.clone()),
            _ => lookup(name).map(|d| d.value.to_string()),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.local
            .get(&name)
            .or_else(|| self.session.get(&name))
            .cloned()
            .or_else(|| self.default_value(&name))
    }

    /// Applies `SET name TO value` (`None` meaning `DEFAULT`).
    ///
    /// Returns the ParameterStatus to send, if the setting is reported to
    /// clients.
    pub fn set(&mut self, name: &str, value: Option<String>, local: bool) -> PgResult<Option<(String, String)>> {
        let name = name.to_ascii_lowercase();
        if READ_ONLY.contains(&name.as_str()) {
            return Err(PgError::new(
                sqlstate::CANT_CHANGE_RUNTIME_PARAM,
                format!("parameter \"{name}\" cannot be changed"),
            ));
        }
        let value = value.map(|v| unquote(&v));
        if name == "client_encoding" {
            if let Some(encoding) = &value {
                let upper = encoding.to_ascii_uppercase().replace(['-', '_'], "");
                if upper != "UTF8" && upper != "UNICODE" {
                    return Err(PgError::unsupported(format!(
                        "client encoding \"{encoding}\" is not supported"
                    )));
                }
            }
        }
        let target = if local { &mut self.local } else { &mut self.session };
        match value {
            Some(value) => {
                let value = if name == "client_encoding" { "UTF8".to_string() } else { value };
                target.insert(name.clone(), value);
            }
            None => {
                target.remove(&name);
            }
        }
        Ok(self.report(&name))
    }

    pub fn reset(&mut self, name: &str) -> PgResult<Option<(String, String)>> {
        self.set(name, None, false)
    }

    /// `RESET ALL`. Returns the ParameterStatus messages for every reported
    /// setting that changed.
    pub fn reset_all(&mut self) -> Vec<(String, String)> {
        let mut changed: Vec<String> = self.session.keys().chain(self.local.keys()).cloned().collect();
        changed.sort();
        changed.dedup();
        self.session.clear();
        self.local.clear();
        changed.iter().filter_map(|name| self.report(name)).collect()
    }

    /// Drops `SET LOCAL` values at transaction end.
    pub fn end_transaction(&mut self) -> Vec<(String, String)> {
        let changed: Vec<String> = std::mem::take(&mut self.local).into_keys().collect();
        changed.iter().filter_map(|name| self.report(name)).collect()
    }

    fn report(&self, name: &str) -> Option<(String, String)> {
        let default = lookup(name).filter(|d| d.reported)?;
        Some((default.display.to_string(), self.get(name).unwrap_or_default()))
    }

    /// Everything sent as ParameterStatus after authentication.
    pub fn reported(&self) -> Vec<(String, String)> {
        DEFAULTS
            .iter()
            .filter(|d| d.reported)
            .map(|d| (d.display.to_string(), self.get(d.name).unwrap_or_default()))
            .collect()
    }

    /// Value for `SHOW name`.
    pub fn show(&self, name: &str) -> PgResult<String> {
        self.get(name).ok_or_else(|| {
            PgError::new(
                sqlstate::UNDEFINED_OBJECT,
                format!("unrecognized configuration parameter \"{name}\""),
            )
        })
    }

    /// Rows for `SHOW ALL`: name, setting, description.
    pub fn show_all(&self) -> Vec<[String; 3]> {
        let mut rows: Vec<[String; 3]> = DEFAULTS
            .iter()
            .map(|d| {
                [
                    d.name.to_string(),
                    self.get(d.name).unwrap_or_default(),
                    d.description.to_string(),
                ]
            })
            .collect();
        for name in self.session.keys().chain(self.local.keys()) {
            if lookup(name).is_none() && !rows.iter().any(|row| &row[0] == name) {
                rows.push([name.clone(), self.get(name).unwrap_or_default(), String::new()]);
            }
        }
        rows.sort_by(|a, b| a[0].cmp(&b[0]));
        rows
    }
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        trimmed[1..trimmed.len() - 1].replace("''", "'")
    } else {
        trimmed.to_string()
    }
}
