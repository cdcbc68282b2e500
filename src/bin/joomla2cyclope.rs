use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use joomla_to_cyclope::config::{MigrationConfig, MigrationOptions, SourceSettings, DEFAULT_MEDIA_URL, DEFAULT_PAGE_SIZE};
use joomla_to_cyclope::database_ops::{db::Db, legacy::LegacyDb, memory::MemoryTarget};
use joomla_to_cyclope::migrate::content::ImgTagScanner;
use joomla_to_cyclope::migrate::linker::DEFAULT_LINK_CHUNK;
use joomla_to_cyclope::orchestrator::{Migration, MigrationReport};
use joomla_to_cyclope::store::TargetStore;
use joomla_to_cyclope::tracing::{init_tracing, DEFAULT_FILTER};
use joomla_to_cyclope::util::env::{env_flag, env_opt, env_parse, init_env, log_snapshot, target_db_url};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "joomla2cyclope",
    version,
    about = "Migrate a Joomla 2.5/3 site into a Cyclope database"
)]
struct Cli {
    /// Joomla MySQL host (env JOOMLA_HOST)
    #[arg(long)]
    server: Option<String>,
    /// Joomla MySQL port (env JOOMLA_PORT, default 3306)
    #[arg(long)]
    port: Option<u16>,
    /// Joomla database name (env JOOMLA_DATABASE)
    #[arg(long)]
    database: Option<String>,
    /// Joomla database user (env JOOMLA_USER)
    #[arg(long)]
    user: Option<String>,
    /// Joomla database password (env JOOMLA_PASSWORD)
    #[arg(long)]
    password: Option<String>,
    /// Joomla table prefix, e.g. `jos_` (env JOOMLA_PREFIX)
    #[arg(long)]
    prefix: Option<String>,
    /// Cyclope Postgres URL; falls back to DATABASE_URL / DB_URL / DB_* vars
    #[arg(long = "target-url")]
    target_url: Option<String>,
    /// Maximum number of articles to migrate
    #[arg(long)]
    limit: Option<u64>,
    /// Articles to skip before migrating (requires --limit)
    #[arg(long)]
    offset: Option<u64>,
    /// Password given to every migrated user; unusable passwords otherwise
    #[arg(long = "default-password")]
    default_password: Option<String>,
    /// Relations per insert statement (env LINK_CHUNK)
    #[arg(long = "link-chunk")]
    link_chunk: Option<usize>,
    /// Articles per source page (env SOURCE_PAGE_SIZE)
    #[arg(long = "page-size")]
    page_size: Option<usize>,
    #[arg(long = "categories-collection", default_value = "Categories")]
    categories_collection: String,
    #[arg(long = "tags-collection", default_value = "Tags")]
    tags_collection: String,
    /// Prefix of rewritten image URLs
    #[arg(long = "media-url", default_value = DEFAULT_MEDIA_URL)]
    media_url: String,
    /// Run against an in-memory target; nothing is written (env DRY_RUN)
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Write the migration report as JSON
    #[arg(long = "report-json")]
    report_json: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> MigrationConfig {
        let source = SourceSettings {
            host: self.server.or_else(|| env_opt("JOOMLA_HOST")).unwrap_or_default(),
            port: self.port.unwrap_or_else(|| env_parse("JOOMLA_PORT", 3306u16)),
            database: self
                .database
                .or_else(|| env_opt("JOOMLA_DATABASE"))
                .unwrap_or_default(),
            user: self.user.or_else(|| env_opt("JOOMLA_USER")).unwrap_or_default(),
            password: self.password.or_else(|| env_opt("JOOMLA_PASSWORD")),
            prefix: self.prefix.or_else(|| env_opt("JOOMLA_PREFIX")).unwrap_or_default(),
        };
        let options = MigrationOptions {
            limit: self.limit,
            offset: self.offset,
            default_password: self.default_password,
            link_chunk: self
                .link_chunk
                .unwrap_or_else(|| env_parse("LINK_CHUNK", DEFAULT_LINK_CHUNK)),
            page_size: self
                .page_size
                .unwrap_or_else(|| env_parse("SOURCE_PAGE_SIZE", DEFAULT_PAGE_SIZE)),
            categories_collection: self.categories_collection,
            tags_collection: self.tags_collection,
            media_url: self.media_url,
        };
        let dry_run = self.dry_run || env_flag("DRY_RUN", false);
        MigrationConfig {
            source,
            target_url: self.target_url.or_else(|| target_db_url().ok()),
            options,
            dry_run,
            report_json: self.report_json,
        }
    }
}

fn snapshot(config: &MigrationConfig) {
    let opt = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
    log_snapshot(
        "joomla2cyclope configuration",
        &[
            ("JOOMLA_HOST", config.source.host.clone()),
            ("JOOMLA_PORT", config.source.port.to_string()),
            ("JOOMLA_DATABASE", config.source.database.clone()),
            ("JOOMLA_USER", config.source.user.clone()),
            (
                "JOOMLA_PASSWORD",
                config.source.password.clone().unwrap_or_default(),
            ),
            ("JOOMLA_PREFIX", config.source.prefix.clone()),
            ("DATABASE_URL", config.target_url.clone().unwrap_or_default()),
            ("LIMIT", opt(config.options.limit)),
            ("OFFSET", opt(config.options.offset)),
            ("LINK_CHUNK", config.options.link_chunk.to_string()),
            ("SOURCE_PAGE_SIZE", config.options.page_size.to_string()),
            ("DRY_RUN", config.dry_run.to_string()),
        ],
    );
}

async fn migrate(config: &MigrationConfig, source: &LegacyDb, target: &dyn TargetStore) -> Result<MigrationReport> {
    let scanner = ImgTagScanner::new().context("compiling image tag patterns")?;
    Migration::new(source, target, &scanner, config.options.clone())
        .run()
        .await
}

async fn run(config: MigrationConfig) -> Result<()> {
    // Rejected here, before any connection is attempted.
    config.validate()?;
    snapshot(&config);

    let max_connections = env_parse("DB_MAX_CONNECTIONS", 4u32);
    let dsn = config.source.dsn()?;
    let source = LegacyDb::connect(&dsn, &config.source.prefix, max_connections)
        .await
        .context("connecting to the Joomla database")?;

    let report = if config.dry_run {
        info!("dry run: writing to an in-memory target");
        let target = MemoryTarget::new();
        migrate(&config, &source, &target).await?
    } else {
        let url = config
            .target_url
            .as_deref()
            .context("no target database URL")?;
        let db = Db::connect(url, max_connections)
            .await
            .context("connecting to the Cyclope database")?;
        let missing = db.missing_tables().await?;
        if !missing.is_empty() {
            anyhow::bail!(
                "Cyclope schema incomplete, run its migrations first (missing: {})",
                missing.join(", ")
            );
        }
        migrate(&config, &source, &db).await?
    };

    report.log_summary();
    if let Some(path) = &config.report_json {
        report.write_json(path)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing(DEFAULT_FILTER)?;

    let config = Cli::parse().into_config();
    if let Err(e) = run(config).await {
        error!(error = ?e, "migration failed");
        return Err(e);
    }
    Ok(())
}
