// src/env.rs
// Environment variable lookups used for credential fallbacks.

use std::collections::HashMap;

pub const ENV_USERNAME: &str = "IONOS_USERNAME";
pub const ENV_PASSWORD: &str = "IONOS_PASSWORD";
pub const ENV_TOKEN: &str = "IONOS_TOKEN";

/// Source of environment variables. Empty values count as unset.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|value| !value.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|value| !value.is_empty()).cloned()
    }
}

/// Fills `field` from `key` when it is still empty. Returns whether it did.
pub fn fallback(field: &mut String, env: &dyn EnvSource, key: &str) -> bool {
    if !field.is_empty() {
        return false;
    }
    match env.var(key) {
        Some(value) => {
            *field = value;
            true
        }
        None => false,
    }
}
