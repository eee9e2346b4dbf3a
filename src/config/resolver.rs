use super::ConfigurationError;
use std::collections::HashMap;

/// Host-provided lookup from setting names to configured values.
pub trait NameResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolves from an in-memory settings map (keys compared case-insensitively),
/// falling back to environment variables.
#[derive(Debug, Clone, Default)]
pub struct SettingsNameResolver {
    settings: HashMap<String, String>,
    use_environment: bool,
}

impl SettingsNameResolver {
    pub fn new(settings: HashMap<String, String>) -> Self {
        Self {
            settings,
            use_environment: true,
        }
    }

    /// A resolver that never consults the process environment.
    pub fn isolated(settings: HashMap<String, String>) -> Self {
        Self {
            settings,
            use_environment: false,
        }
    }
}

impl NameResolver for SettingsNameResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        let configured = self.settings.get(name).or_else(|| {
            self.settings
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        });
        if let Some(value) = configured {
            return Some(value.clone());
        }
        if !self.use_environment {
            return None;
        }
        std::env::var(name)
            .ok()
            .or_else(|| std::env::var(name.replace(':', "__")).ok())
    }
}

/// Expands every `%name%` occurrence in `value`; `%%` yields a literal `%`.
pub fn resolve_placeholders(
    resolver: &dyn NameResolver,
    value: &str,
) -> Result<String, ConfigurationError> {
    let mut output = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find('%') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('%')
            .ok_or_else(|| ConfigurationError::UnterminatedPlaceholder {
                value: value.to_string(),
            })?;

        let name = &after[..end];
        if name.is_empty() {
            output.push('%');
        } else {
            let resolved =
                resolver
                    .resolve(name)
                    .ok_or_else(|| ConfigurationError::MissingSetting {
                        name: name.to_string(),
                    })?;
            output.push_str(&resolved);
        }
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

/// Strips `%...%` markers from a setting reference, so `%name%` and `name` agree.
pub fn setting_name(setting: &str) -> &str {
    let trimmed = setting.trim();
    trimmed
        .strip_prefix('%')
        .and_then(|inner| inner.strip_suffix('%'))
        .filter(|inner| !inner.is_empty() && !inner.contains('%'))
        .unwrap_or(trimmed)
}

/// Resolves a setting reference to its configured value.
pub fn resolve_setting(
    resolver: &dyn NameResolver,
    setting: &str,
) -> Result<String, ConfigurationError> {
    let name = setting_name(setting);
    resolver
        .resolve(name)
        .ok_or_else(|| ConfigurationError::MissingSetting {
            name: name.to_string(),
        })
}
