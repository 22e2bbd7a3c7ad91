use std::collections::HashMap;
use std::env;

/// Read-only lookup of provider secrets.
pub trait CredentialStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads credentials from the process environment. Empty values count as
/// absent. Some names have fallbacks that older setups used.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    aliases: HashMap<String, Vec<String>>,
}

impl EnvCredentials {
    pub fn new() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert(
            "GEMINI_API_KEY".to_string(),
            vec!["GOOGLE_API_KEY".to_string(), "GOOGLE_KEY".to_string()],
        );
        Self { aliases }
    }

    pub fn with_alias(mut self, name: &str, alias: &str) -> Self {
        self.aliases
            .entry(name.to_string())
            .or_default()
            .push(alias.to_string());
        self
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvCredentials {
    fn get(&self, name: &str) -> Option<String> {
        let fallbacks = self.aliases.get(name).map(Vec::as_slice).unwrap_or(&[]);
        std::iter::once(name)
            .chain(fallbacks.iter().map(String::as_str))
            .find_map(|key| env::var(key).ok().filter(|value| !value.trim().is_empty()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn get(&self, name: &str) -> Option<String> {
        self.values
            .get(name)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_store_treats_blank_as_absent() {
        let store = StaticCredentials::new()
            .with("FAL_API_KEY", "abc")
            .with("LUMA_API_KEY", "  ");
        assert_eq!(store.get("FAL_API_KEY").as_deref(), Some("abc"));
        assert_eq!(store.get("LUMA_API_KEY"), None);
        assert_eq!(store.get("RUNWAY_API_KEY"), None);
    }

    #[test]
    fn env_store_follows_aliases() {
        env::set_var("STUDIO_RELAY_TEST_ALIAS_TARGET", "from-alias");
        let store = EnvCredentials::new().with_alias(
            "STUDIO_RELAY_TEST_PRIMARY_UNSET",
            "STUDIO_RELAY_TEST_ALIAS_TARGET",
        );
        assert_eq!(
            store.get("STUDIO_RELAY_TEST_PRIMARY_UNSET").as_deref(),
            Some("from-alias")
        );
        env::remove_var("STUDIO_RELAY_TEST_ALIAS_TARGET");
    }
}
