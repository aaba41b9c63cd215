//! Opskit core types: environment context and settings plumbing.

#![forbid(unsafe_code)]

use std::collections::HashMap;

/// Name of the variable an automation host exposes for managed-identity
/// token exchange. Its presence is how we detect that host.
pub const IDENTITY_ENDPOINT_VAR: &str = "IDENTITY_ENDPOINT";

/// Capability object over the process environment, resolved once at startup
/// and passed by reference to all call sites. Backed by a snapshot so tests
/// can construct one from a plain map.
#[derive(Debug, Clone)]
pub struct EnvironmentContext {
    vars: HashMap<String, String>,
}

impl EnvironmentContext {
    /// Snapshot the current process environment.
    pub fn from_os() -> Self {
        Self { vars: std::env::vars().collect() }
    }

    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    /// Look up a variable; empty values count as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or(default).to_string()
    }

    /// True when running under an automation host that exposes a
    /// managed-identity endpoint.
    pub fn is_automation_host(&self) -> bool {
        self.get(IDENTITY_ENDPOINT_VAR).is_some()
    }
}
