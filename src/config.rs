//! Run configuration and its boundary validation.
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::migrate::linker::DEFAULT_LINK_CHUNK;
use crate::util::env::build_mysql_dsn;

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_MEDIA_URL: &str = "/media/";

/// Connection to the legacy MySQL site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    /// Table prefix, e.g. `jos_`. May be empty.
    pub prefix: String,
}

impl SourceSettings {
    pub fn dsn(&self) -> anyhow::Result<String> {
        build_mysql_dsn(
            &self.host,
            self.port,
            &self.database,
            &self.user,
            self.password.as_deref(),
        )
    }
}

/// Knobs of the migration itself, independent of where the data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Maximum number of articles to read.
    pub limit: Option<u64>,
    /// Articles to skip; only meaningful together with `limit`.
    pub offset: Option<u64>,
    /// Password given to every migrated user. `None` leaves accounts unusable
    /// until reset.
    pub default_password: Option<String>,
    pub link_chunk: usize,
    pub page_size: usize,
    pub categories_collection: String,
    pub tags_collection: String,
    /// Public prefix of the media root, used when rewriting image sources.
    pub media_url: String,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            limit: None,
            offset: None,
            default_password: None,
            link_chunk: DEFAULT_LINK_CHUNK,
            page_size: DEFAULT_PAGE_SIZE,
            categories_collection: "Categories".to_string(),
            tags_collection: "Tags".to_string(),
            media_url: DEFAULT_MEDIA_URL.to_string(),
        }
    }
}

impl MigrationOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.offset.is_some() && self.limit.is_none() {
            return Err(ConfigError::OffsetWithoutLimit);
        }
        if self.link_chunk == 0 {
            return Err(ConfigError::ZeroSize("link chunk"));
        }
        if self.page_size == 0 {
            return Err(ConfigError::ZeroSize("page size"));
        }
        if self.limit == Some(0) {
            return Err(ConfigError::ZeroSize("limit"));
        }
        Ok(())
    }

    /// First article row and the number of rows to read (`None`: all).
    pub fn article_window(&self) -> (u64, Option<u64>) {
        (self.offset.unwrap_or(0), self.limit)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: SourceSettings,
    pub target_url: Option<String>,
    pub options: MigrationOptions,
    pub dry_run: bool,
    pub report_json: Option<PathBuf>,
}

impl MigrationConfig {
    /// Checked before any connection is attempted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.host.trim().is_empty() {
            return Err(ConfigError::Missing("server"));
        }
        if self.source.database.trim().is_empty() {
            return Err(ConfigError::Missing("database"));
        }
        if self.source.user.trim().is_empty() {
            return Err(ConfigError::Missing("user"));
        }
        if !self.dry_run && self.target_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(ConfigError::Missing("target-url"));
        }
        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MigrationConfig {
        MigrationConfig {
            source: SourceSettings {
                host: "localhost".into(),
                port: 3306,
                database: "joomla".into(),
                user: "root".into(),
                password: None,
                prefix: "jos_".into(),
            },
            target_url: Some("postgres://localhost/cyclope".into()),
            options: MigrationOptions::default(),
            dry_run: false,
            report_json: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(config().validate(), Ok(()));
        assert_eq!(MigrationOptions::default().link_chunk, 500);
    }

    #[test]
    fn offset_requires_limit() {
        let mut c = config();
        c.options.offset = Some(10);
        assert_eq!(c.validate(), Err(ConfigError::OffsetWithoutLimit));
        c.options.limit = Some(5);
        assert_eq!(c.validate(), Ok(()));
        assert_eq!(c.options.article_window(), (10, Some(5)));
    }

    #[test]
    fn zero_sizes_rejected() {
        let mut c = config();
        c.options.link_chunk = 0;
        assert_eq!(c.validate(), Err(ConfigError::ZeroSize("link chunk")));
        let mut c = config();
        c.options.page_size = 0;
        assert_eq!(c.validate(), Err(ConfigError::ZeroSize("page size")));
    }

    #[test]
    fn target_only_required_outside_dry_run() {
        let mut c = config();
        c.target_url = None;
        assert_eq!(c.validate(), Err(ConfigError::Missing("target-url")));
        c.dry_run = true;
        assert_eq!(c.validate(), Ok(()));
        c.source.user = " ".into();
        assert_eq!(c.validate(), Err(ConfigError::Missing("user")));
    }
}
