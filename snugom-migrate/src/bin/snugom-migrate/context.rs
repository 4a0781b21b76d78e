use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use snugom_migrate::{ChangeLog, Logger, MigrateConfig, MigrationRunner, RedisBackend};

/// Project context for snugom-migrate operations
pub struct ProjectContext {
    /// Directory holding `.snugom/`
    pub project_root: PathBuf,
    /// Path to config file
    pub config_path: PathBuf,
    /// Loaded configuration, defaults when no config file exists
    pub config: MigrateConfig,
}

impl ProjectContext {
    /// Find and load project context from current directory or ancestors
    pub fn find(config_override: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_override {
            let config = MigrateConfig::load(path)?;
            let project_root = path
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Ok(Self {
                project_root,
                config_path: path.to_path_buf(),
                config,
            });
        }
        let current_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::find_from(&current_dir)
    }

    /// Find project context starting from the given directory
    pub fn find_from(start: &Path) -> Result<Self> {
        let project_root = Self::find_project_root(start).unwrap_or_else(|| start.to_path_buf());
        Self::from_root(project_root)
    }

    /// Create context from a known project root
    pub fn from_root(project_root: PathBuf) -> Result<Self> {
        let config_path = project_root.join(".snugom").join("migrate.toml");

        let config = if config_path.exists() {
            MigrateConfig::load(&config_path)
                .with_context(|| format!("Failed to load {}", config_path.display()))?
        } else {
            MigrateConfig::default()
        };

        Ok(Self {
            project_root,
            config_path,
            config,
        })
    }

    /// Nearest ancestor with a `.snugom/migrate.toml`, falling back to the
    /// nearest one with a `Cargo.toml`.
    fn find_project_root(start: &Path) -> Option<PathBuf> {
        let configured = start
            .ancestors()
            .find(|dir| dir.join(".snugom").join("migrate.toml").exists());
        configured
            .or_else(|| start.ancestors().find(|dir| dir.join("Cargo.toml").exists()))
            .map(Path::to_path_buf)
    }

    /// Load the changelog named on the command line, or the configured one.
    pub fn load_changelog(&self, explicit: Option<&Path>) -> Result<ChangeLog> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let configured = self.config.changelog.file.as_deref().context(
                    "No changelog given. Pass --changelog or set changelog.file in .snugom/migrate.toml",
                )?;
                self.project_root.join(configured)
            }
        };
        ChangeLog::load(&path).with_context(|| format!("Failed to load changelog {}", path.display()))
    }

    /// Connect to Redis and build a runner over it.
    pub async fn runner(&self) -> Result<MigrationRunner<RedisBackend>> {
        let url = self.config.redis_url()?;
        let backend = RedisBackend::connect(&url, self.config.redis.prefix.clone())
            .await
            .with_context(|| format!("Failed to connect to {}", snugom_migrate::config::redact_url(&url)))?;
        Ok(MigrationRunner::new(
            backend,
            &self.config,
            Logger::new("snugom_migrate"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = ProjectContext::from_root(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(ctx.config, MigrateConfig::default());
        assert!(ctx.config_path.ends_with(".snugom/migrate.toml"));
    }

    #[test]
    fn test_finds_config_in_ancestor() {
        let temp_dir = TempDir::new().unwrap();
        let snugom_dir = temp_dir.path().join(".snugom");
        std::fs::create_dir_all(&snugom_dir).unwrap();
        std::fs::write(
            snugom_dir.join("migrate.toml"),
            "[changelog]\nfile = \"db/changelog.json\"\n",
        )
        .unwrap();
        let nested = temp_dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let ctx = ProjectContext::find_from(&nested).unwrap();
        assert_eq!(ctx.project_root, temp_dir.path());
        assert_eq!(ctx.config.changelog.file.as_deref(), Some("db/changelog.json"));
    }

    #[test]
    fn test_missing_changelog_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = ProjectContext::from_root(temp_dir.path().to_path_buf()).unwrap();
        let err = ctx.load_changelog(None).unwrap_err();
        assert!(err.to_string().contains("No changelog given"));
    }
}
