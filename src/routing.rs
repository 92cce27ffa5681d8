//! Routing tokens and static metadata.
//!
//! Both are resolved once from the finished configuration and are read-only
//! for the lifetime of the pipeline.

use crate::config::ConfigError;
use crate::record::RecordKind;

/// Mapping from record kind to routing token.
///
/// Empty tokens are treated as unset, so a kind either has a usable token
/// or none at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingConfig {
    logs: Option<String>,
    events: Option<String>,
    stats: Option<String>,
}

impl RoutingConfig {
    /// Create an empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve per-kind tokens, filling gaps from the shared fallback token.
    pub fn resolve(
        logs: Option<&str>,
        events: Option<&str>,
        stats: Option<&str>,
        fallback: Option<&str>,
    ) -> Self {
        let pick = |specific: Option<&str>| non_empty(specific).or_else(|| non_empty(fallback));

        Self {
            logs: pick(logs),
            events: pick(events),
            stats: pick(stats),
        }
    }

    /// Set the token for one kind.
    #[must_use]
    pub fn with_token(mut self, kind: RecordKind, token: impl Into<String>) -> Self {
        let token = token.into();
        *self.slot_mut(kind) = (!token.is_empty()).then_some(token);
        self
    }

    /// The token for `kind`, if one is configured.
    pub fn token_for(&self, kind: RecordKind) -> Option<&str> {
        match kind {
            RecordKind::Logs => self.logs.as_deref(),
            RecordKind::Events => self.events.as_deref(),
            RecordKind::Stats => self.stats.as_deref(),
        }
    }

    /// Kinds that have a usable token.
    pub fn routable_kinds(&self) -> impl Iterator<Item = RecordKind> + '_ {
        RecordKind::all()
            .iter()
            .copied()
            .filter(|kind| self.token_for(*kind).is_some())
    }

    fn slot_mut(&mut self, kind: RecordKind) -> &mut Option<String> {
        match kind {
            RecordKind::Logs => &mut self.logs,
            RecordKind::Events => &mut self.events,
            RecordKind::Stats => &mut self.stats,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Ordered key/value pairs injected into every forwarded record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticMetadata {
    entries: Vec<(String, String)>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs; a later duplicate key replaces the earlier value.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut metadata = Self::new();
        for (key, value) in pairs {
            metadata.insert(key, value);
        }
        metadata
    }

    /// Parse `NAME=VALUE` entries as given on the command line.
    ///
    /// The value may be empty and may itself contain `=`.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        let mut metadata = Self::new();
        for entry in entries {
            let (key, value) = parse_pair(entry.as_ref())?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }

    /// Insert a pair, replacing the value in place if the key exists.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split one `NAME=VALUE` entry.
pub fn parse_pair(entry: &str) -> Result<(String, String), ConfigError> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::InvalidMetadata(entry.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_with_fallback() {
        let routing = RoutingConfig::resolve(Some("logs-tok"), None, Some(""), Some("shared"));
        assert_eq!(routing.token_for(RecordKind::Logs), Some("logs-tok"));
        assert_eq!(routing.token_for(RecordKind::Events), Some("shared"));
        assert_eq!(routing.token_for(RecordKind::Stats), Some("shared"));
    }

    #[test]
    fn test_resolve_without_fallback() {
        let routing = RoutingConfig::resolve(None, Some("events-tok"), Some(""), None);
        assert_eq!(routing.token_for(RecordKind::Logs), None);
        assert_eq!(routing.token_for(RecordKind::Stats), None);
        assert_eq!(
            routing.routable_kinds().collect::<Vec<_>>(),
            vec![RecordKind::Events]
        );
    }

    #[test]
    fn test_empty_token_is_unset() {
        let routing = RoutingConfig::new().with_token(RecordKind::Logs, "");
        assert_eq!(routing.token_for(RecordKind::Logs), None);
        assert_eq!(routing.routable_kinds().count(), 0);
    }

    #[test]
    fn test_metadata_later_key_wins_in_place() {
        let metadata = StaticMetadata::from_pairs([("host", "a"), ("env", "prod"), ("host", "b")]);
        let pairs: Vec<_> = metadata.iter().collect();
        assert_eq!(pairs, vec![("host", "b"), ("env", "prod")]);
    }

    #[test]
    fn test_parse_entries() {
        let metadata = StaticMetadata::parse(&["host=h1", "empty=", "url=a=b"]).unwrap();
        assert_eq!(metadata.get("host"), Some("h1"));
        assert_eq!(metadata.get("empty"), Some(""));
        assert_eq!(metadata.get("url"), Some("a=b"));
        assert_eq!(metadata.len(), 3);
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let err = StaticMetadata::parse(&["host"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMetadata(ref entry) if entry == "host"));

        assert!(parse_pair("=value").is_err());
    }
}
