//! Postgres connection pool and pgmq setup.
//!
//! One pool per process, shared by every queue the pgmq transport touches.

pub mod pgmq;

pub use pgmq::{PgmqMessage, PgmqTransport};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the pgmq extension if the database does not have it yet.
    pub async fn ensure_pgmq(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS pgmq")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Round-trip a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
