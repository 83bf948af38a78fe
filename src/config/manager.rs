use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ShoalResult;

/// Holds the live configuration and hot-reloads it from disk.
///
/// A reload that fails to parse or validate is discarded; callers keep
/// seeing the previous configuration.
pub struct ConfigManager {
    config: RwLock<Arc<Config>>,
    config_path: PathBuf,
}

impl ConfigManager {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> ShoalResult<Self> {
        let config = Config::from_file(path.as_ref()).await?;
        info!("Config manager initialized with hot-reload");

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            config_path: path.as_ref().to_path_buf(),
        })
    }

    /// The current configuration snapshot
    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Re-read the config file; invalid content keeps the previous config.
    pub async fn reload(&self) -> ShoalResult<()> {
        match Config::from_file(&self.config_path).await {
            Ok(config) => {
                let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
                *guard = Arc::new(config);
                info!("Config reloaded successfully");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Config reload failed, keeping previous configuration");
                Err(e)
            }
        }
    }

    /// Watch the config file until shutdown fires.
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
                Err(e) => warn!(error = %e, "Config file watch error"),
            }
        })?;
        watcher.watch(&self.config_path, RecursiveMode::NonRecursive)?;
        info!(path = %self.config_path.display(), "Watching config file for changes");

        let manager = self;
        tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    changed = rx.recv() => {
                        if changed.is_none() {
                            return;
                        }
                        debug!("Config file changed");
                        let _ = manager.reload().await;
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[server]
port = 8080

[routing]
file = "routing.toml"
"#;

    #[tokio::test]
    async fn test_reload_keeps_previous_on_invalid() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let file = tempfile::NamedTempFile::new().unwrap();
            std::fs::write(file.path(), VALID).unwrap();

            let manager = ConfigManager::from_file(file.path()).await.unwrap();
            assert_eq!(manager.current().server.port, 8080);

            std::fs::write(file.path(), "[server]\nport = 0\n[routing]\nfile = \"r\"").unwrap();
            assert!(manager.reload().await.is_err());
            assert_eq!(manager.current().server.port, 8080);

            std::fs::write(file.path(), VALID.replace("8080", "9090")).unwrap();
            manager.reload().await.unwrap();
            assert_eq!(manager.current().server.port, 9090);
        })
        .await
        .expect("test_reload_keeps_previous_on_invalid timed out");
    }

    #[tokio::test]
    async fn test_from_file_rejects_invalid() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let file = tempfile::NamedTempFile::new().unwrap();
            std::fs::write(file.path(), "[server]\nport = 0").unwrap();
            assert!(ConfigManager::from_file(file.path()).await.is_err());
        })
        .await
        .expect("test_from_file_rejects_invalid timed out");
    }
}
