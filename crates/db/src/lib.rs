use std::str::FromStr;

use sqlx::{
    Error, Pool, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use utils::assets::asset_dir;

pub mod models;

const DATABASE_URL_ENV: &str = "APHRODITE_DATABASE_URL";

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    pub async fn new() -> Result<DBService, Error> {
        let pool = Self::create_pool().await?;
        Ok(DBService { pool })
    }

    /// Build a service around an already-open pool, e.g. an in-memory
    /// pool constructed by tests.
    pub fn from_pool(pool: Pool<Sqlite>) -> DBService {
        DBService { pool }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn new_in_memory() -> Result<DBService, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }

    async fn create_pool() -> Result<Pool<Sqlite>, Error> {
        let database_url = std::env::var(DATABASE_URL_ENV).unwrap_or_else(|_| {
            format!("sqlite://{}", asset_dir().join("db.sqlite").to_string_lossy())
        });
        let options = SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true).foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(pool)
    }
}
