use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ShoalError, ShoalResult};

/// One ordered routing rule; first prefix match wins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub service_name: String,
    #[serde(default)]
    pub strip_prefix: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRules {
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub default_service: String,
}

/// Maps URL prefixes to service names from an ordered rule file.
///
/// The rule file hot-reloads: an edited file that fails validation is
/// discarded and the previous rules stay in effect.
pub struct PathRouter {
    state: RwLock<RoutingRules>,
    config_path: PathBuf,
}

impl PathRouter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ShoalResult<Self> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)?;
        let rules = parse_rules(&content)?;

        info!(
            rules_count = rules.rules.len(),
            default_service = %rules.default_service,
            path = %config_path.display(),
            "Routing rules loaded"
        );

        Ok(Self {
            state: RwLock::new(rules),
            config_path,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_rules(rules: RoutingRules) -> Self {
        Self {
            state: RwLock::new(rules),
            config_path: PathBuf::new(),
        }
    }

    /// Service for the first rule whose prefix matches `path`, falling back
    /// to the default service. Empty means no match.
    pub fn match_service(&self, path: &str) -> String {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());

        for rule in &state.rules {
            if path.starts_with(&rule.prefix) {
                return rule.service_name.clone();
            }
        }
        state.default_service.clone()
    }

    /// Strip flag of the first matching rule
    pub fn strip_prefix(&self, path: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());

        for rule in &state.rules {
            if path.starts_with(&rule.prefix) {
                return rule.strip_prefix;
            }
        }
        false
    }

    /// Re-read the rule file; on parse or validation failure the previous
    /// rules are kept.
    pub fn reload(&self) -> ShoalResult<()> {
        let content = std::fs::read_to_string(&self.config_path)?;

        match parse_rules(&content) {
            Ok(rules) => {
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                *state = rules;
                info!(
                    rules_count = state.rules.len(),
                    default_service = %state.default_service,
                    "Routing rules reloaded"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    error = %e,
                    path = %self.config_path.display(),
                    "Invalid routing config, keeping previous configuration"
                );
                Err(e)
            }
        }
    }

    /// Watch the rule file and reload on change until shutdown fires.
    pub fn watch(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> ShoalResult<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = tx.blocking_send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Routing file watch error"),
            }
        })?;
        watcher.watch(&self.config_path, RecursiveMode::NonRecursive)?;
        info!(path = %self.config_path.display(), "Watching routing config for changes");

        let router = self;
        tokio::spawn(async move {
            // Owned by the task so the watcher lives as long as the loop.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    changed = rx.recv() => {
                        if changed.is_none() {
                            return;
                        }
                        debug!("Routing file changed");
                        let _ = router.reload();
                    }
                }
            }
        });

        Ok(())
    }
}

fn parse_rules(content: &str) -> ShoalResult<RoutingRules> {
    let rules: RoutingRules = toml::from_str(content)?;
    validate_rules(&rules)?;
    Ok(rules)
}

fn validate_rules(cfg: &RoutingRules) -> ShoalResult<()> {
    let mut errs: Vec<String> = Vec::new();

    if cfg.rules.is_empty() {
        if cfg.default_service.is_empty() {
            errs.push("no routing rules and no default_service configured".to_string());
        } else {
            warn!("no routing rules defined, all traffic will go to default_service");
        }
    } else if cfg.default_service.is_empty() {
        warn!("no default_service configured, requests without matching prefix will fail");
    }

    let mut seen = std::collections::HashSet::new();
    for (i, rule) in cfg.rules.iter().enumerate() {
        let rule_idx = i + 1;

        if rule.prefix.is_empty() {
            errs.push(format!("rule #{}: prefix is empty", rule_idx));
            continue;
        }

        if !rule.prefix.starts_with('/') {
            warn!(
                rule_idx,
                prefix = %rule.prefix,
                "rule prefix should start with '/'"
            );
        }

        if rule.service_name.is_empty() {
            errs.push(format!(
                "rule #{}: service_name is empty (prefix: {})",
                rule_idx, rule.prefix
            ));
            continue;
        }

        if !seen.insert(rule.prefix.clone()) {
            errs.push(format!(
                "duplicate prefix detected: '{}' at index {}",
                rule.prefix, rule_idx
            ));
        }

        if rule.prefix == "/" && cfg.rules.len() > 1 {
            warn!(
                rule_idx,
                "prefix '/' will match everything, other rules may be ignored"
            );
        }
    }

    if !errs.is_empty() {
        return Err(ShoalError::config(format!(
            "routing config validation failed: {}",
            errs.join("; ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rule(prefix: &str, service: &str, strip: bool) -> RouteRule {
        RouteRule {
            prefix: prefix.to_string(),
            service_name: service.to_string(),
            strip_prefix: strip,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let router = PathRouter::from_rules(RoutingRules {
            rules: vec![
                rule("/api/v2", "api-next", false),
                rule("/api", "api", true),
                rule("/", "web", false),
            ],
            default_service: String::new(),
        });

        assert_eq!(router.match_service("/api/v2/users"), "api-next");
        assert_eq!(router.match_service("/api/users"), "api");
        assert_eq!(router.match_service("/anything"), "web");

        assert!(!router.strip_prefix("/api/v2/users"));
        assert!(router.strip_prefix("/api/users"));
    }

    #[test]
    fn test_default_service_fallback() {
        let router = PathRouter::from_rules(RoutingRules {
            rules: vec![rule("/api", "api", false)],
            default_service: "web".to_string(),
        });

        assert_eq!(router.match_service("/other"), "web");
        assert!(!router.strip_prefix("/other"));
    }

    #[test]
    fn test_no_match_is_empty() {
        let router = PathRouter::from_rules(RoutingRules {
            rules: vec![rule("/api", "api", false)],
            default_service: String::new(),
        });

        assert_eq!(router.match_service("/other"), "");
    }

    #[test]
    fn test_validation_rejects_empty_config() {
        assert!(parse_rules("").is_err());
    }

    #[test]
    fn test_validation_rejects_empty_prefix() {
        let content = r#"
            [[rules]]
            prefix = ""
            service_name = "api"
        "#;
        assert!(parse_rules(content).is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_prefixes() {
        let content = r#"
            [[rules]]
            prefix = "/api"
            service_name = "a"

            [[rules]]
            prefix = "/api"
            service_name = "b"
        "#;
        let err = parse_rules(content).unwrap_err();
        assert!(err.to_string().contains("duplicate prefix"));
    }

    #[test]
    fn test_validation_accepts_default_only() {
        let rules = parse_rules("default_service = \"web\"").unwrap();
        assert!(rules.rules.is_empty());
        assert_eq!(rules.default_service, "web");
    }

    #[test]
    fn test_reload_keeps_previous_on_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[rules]]\nprefix = \"/api\"\nservice_name = \"api\"\nstrip_prefix = true"
        )
        .unwrap();
        file.flush().unwrap();

        let router = PathRouter::from_file(file.path()).unwrap();
        assert_eq!(router.match_service("/api/x"), "api");

        // Overwrite with an invalid rule set.
        std::fs::write(file.path(), "[[rules]]\nprefix = \"\"\nservice_name = \"x\"").unwrap();
        assert!(router.reload().is_err());
        assert_eq!(router.match_service("/api/x"), "api");

        // A valid rewrite goes through.
        std::fs::write(
            file.path(),
            "[[rules]]\nprefix = \"/api\"\nservice_name = \"renamed\"",
        )
        .unwrap();
        router.reload().unwrap();
        assert_eq!(router.match_service("/api/x"), "renamed");
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[[rules]]\nprefix = \"/a\"\nservice_name = \"\"").unwrap();
        assert!(PathRouter::from_file(file.path()).is_err());
    }
}
