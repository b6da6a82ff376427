//! Processor configuration, read from `CANOPY_*` environment variables.

use std::time::Duration;

use canopy_tree::LeafRule;
use tracing::warn;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Give up on the feed when nothing arrives for this long.
    pub idle_timeout: Duration,
    /// Sort equal-depth actions by name.
    pub deterministic: bool,
    pub leaf_rule: LeafRule,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            deterministic: false,
            leaf_rule: LeafRule::Permit,
        }
    }
}

impl WatchConfig {
    /// `CANOPY_IDLE_TIMEOUT_SECS`, `CANOPY_DETERMINISTIC`, `CANOPY_LEAF_RULE`
    /// (`permit` | `require-children`). Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = get("CANOPY_IDLE_TIMEOUT_SECS") {
            match v.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.idle_timeout = Duration::from_secs(secs),
                _ => warn!(value = %v, "invalid CANOPY_IDLE_TIMEOUT_SECS; using default"),
            }
        }
        if let Some(v) = get("CANOPY_DETERMINISTIC") {
            cfg.deterministic = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("CANOPY_LEAF_RULE") {
            match parse_leaf_rule(&v) {
                Some(rule) => cfg.leaf_rule = rule,
                None => warn!(value = %v, "invalid CANOPY_LEAF_RULE; expected permit|require-children"),
            }
        }
        cfg
    }

    pub fn with_idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn deterministic(mut self, on: bool) -> Self {
        self.deterministic = on;
        self
    }
}

pub fn parse_leaf_rule(s: &str) -> Option<LeafRule> {
    match s.trim().to_ascii_lowercase().as_str() {
        "permit" => Some(LeafRule::Permit),
        "require-children" | "strict" => Some(LeafRule::RequireChildren),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("CANOPY_IDLE_TIMEOUT_SECS", "15"),
            ("CANOPY_DETERMINISTIC", "true"),
            ("CANOPY_LEAF_RULE", "require-children"),
        ]
        .into_iter()
        .collect();
        let cfg = WatchConfig::from_lookup(|k| env.get(k).map(|s| s.to_string()));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(15));
        assert!(cfg.deterministic);
        assert!(matches!(cfg.leaf_rule, LeafRule::RequireChildren));
    }

    #[test]
    fn bad_values_fall_back() {
        let cfg = WatchConfig::from_lookup(|k| match k {
            "CANOPY_IDLE_TIMEOUT_SECS" => Some("0".into()),
            "CANOPY_LEAF_RULE" => Some("bogus".into()),
            _ => None,
        });
        assert_eq!(cfg.idle_timeout, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));
        assert!(!cfg.deterministic);
        assert!(matches!(cfg.leaf_rule, LeafRule::Permit));
    }
}
