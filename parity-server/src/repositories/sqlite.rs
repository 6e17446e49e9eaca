use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};
use tracing::info;

/// Handle to the sqlite database backing the task and runner directories.
/// Connecting creates the file if needed and applies pending migrations.
#[derive(Clone)]
pub struct SqliteDb(pub(crate) SqlitePool);

impl SqliteDb {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new();
        // An in-memory database only lives as long as some connection does,
        // so the pool must never age its connections out or the task and
        // runner tables vanish between queries.
        if options.get_filename() == Path::new(":memory:") {
            pool_options = pool_options.max_lifetime(None).idle_timeout(None);
        }
        let pool = pool_options.connect_with(options).await?;
        info!("Running database migrations");
        sqlx::migrate!().run(&pool).await?;
        info!("Database schema is up to date");
        Ok(Self(pool))
    }
}

impl From<SqliteDb> for SqlitePool {
    fn from(db: SqliteDb) -> Self {
        db.0
    }
}
