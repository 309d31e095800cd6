// Module wiring and re-exports
pub mod channel;
pub mod dao_impl;
pub mod dao_trait;
pub mod message;
pub mod sentiment;

#[cfg(test)]
pub mod memory;

pub use dao_impl::PgHarmonyDao;
pub use dao_trait::{HarmonyDao, LeaseLost};

use anyhow::Context;
use sqlx::{Executor, PgPool};

const SCHEMA: &str = include_str!("../../../migrations/0001_create_harmony_tables.sql");

/// Applies the idempotent table definitions. Safe to run on every start.
pub async fn apply_schema(pool: &PgPool) -> anyhow::Result<()> {
    pool.execute(SCHEMA)
        .await
        .context("failed to apply harmony schema")?;
    Ok(())
}
