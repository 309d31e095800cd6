use anyhow::{Context, Result, anyhow};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::dao_trait::LeaseLost;
use crate::pipeline::stage::Stage;
use crate::store::models::{AttemptLease, Channel, User, UserAlternate};

pub(crate) struct ChannelQueries;

const CHANNEL_COLUMNS: &str = "id, running, stage, progress, message_limit, attempt";

fn channel_from_row(row: &PgRow) -> Result<Channel> {
    let raw_stage: i32 = row.try_get("stage")?;
    let stage = Stage::try_from(raw_stage).map_err(|err| anyhow!(err))?;
    Ok(Channel {
        id: row.try_get("id")?,
        running: row.try_get("running")?,
        stage,
        progress: row.try_get("progress")?,
        limit: row.try_get("message_limit")?,
        attempt: row.try_get("attempt")?,
    })
}

/// Locks the channel row for the rest of `tx`, provided `lease` still holds it.
///
/// `stop` and `try_begin_attempt` update the same row, so they wait for `tx` to finish.
pub(crate) async fn hold_lease(
    tx: &mut Transaction<'_, Postgres>,
    lease: &AttemptLease,
) -> Result<()> {
    let held: Option<i64> = sqlx::query_scalar(
        r"
        SELECT attempt FROM channels
        WHERE id = $1 AND running = TRUE AND attempt = $2
        FOR UPDATE
        ",
    )
    .bind(&lease.channel_id)
    .bind(lease.attempt)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to lock channel")?;

    if held.is_none() {
        return Err(LeaseLost::from(lease).into());
    }
    Ok(())
}

impl ChannelQueries {
    pub async fn ensure_channel(pool: &PgPool, channel_id: &str) -> Result<Channel> {
        sqlx::query(
            r"
            INSERT INTO channels (id) VALUES ($1)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(channel_id)
        .execute(pool)
        .await
        .context("failed to insert channel")?;

        Self::get_channel(pool, channel_id)
            .await?
            .ok_or_else(|| anyhow!("channel {channel_id} vanished after insert"))
    }

    pub async fn get_channel(pool: &PgPool, channel_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"
        ))
        .bind(channel_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch channel")?;

        row.as_ref().map(channel_from_row).transpose()
    }

    /// Compare-and-swap on `running`: the row is only returned to the caller that flipped it.
    pub async fn try_begin_attempt(pool: &PgPool, channel_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(&format!(
            r"
            UPDATE channels
            SET running = TRUE, progress = 0, attempt = attempt + 1, updated_at = NOW()
            WHERE id = $1 AND running = FALSE
            RETURNING {CHANNEL_COLUMNS}
            "
        ))
        .bind(channel_id)
        .fetch_optional(pool)
        .await
        .context("failed to begin stage attempt")?;

        row.as_ref().map(channel_from_row).transpose()
    }

    pub async fn is_running(pool: &PgPool, channel_id: &str) -> Result<bool> {
        let running: Option<bool> =
            sqlx::query_scalar("SELECT running FROM channels WHERE id = $1")
                .bind(channel_id)
                .fetch_optional(pool)
                .await
                .context("failed to read running flag")?;
        Ok(running.unwrap_or(false))
    }

    pub async fn holds_attempt(pool: &PgPool, lease: &AttemptLease) -> Result<bool> {
        let held: Option<bool> = sqlx::query_scalar(
            "SELECT running AND attempt = $2 FROM channels WHERE id = $1",
        )
        .bind(&lease.channel_id)
        .bind(lease.attempt)
        .fetch_optional(pool)
        .await
        .context("failed to read attempt lease")?;
        Ok(held.unwrap_or(false))
    }

    pub async fn set_progress(pool: &PgPool, lease: &AttemptLease, progress: i64) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE channels SET progress = $3, updated_at = NOW()
            WHERE id = $1 AND running = TRUE AND attempt = $2
            ",
        )
        .bind(&lease.channel_id)
        .bind(lease.attempt)
        .bind(progress)
        .execute(pool)
        .await
        .context("failed to update progress")?;

        if result.rows_affected() == 0 {
            return Err(LeaseLost::from(lease).into());
        }
        Ok(())
    }

    pub async fn complete_attempt(
        pool: &PgPool,
        lease: &AttemptLease,
        stage: Stage,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE channels
            SET stage = $4, running = FALSE, progress = 0, updated_at = NOW()
            WHERE id = $1 AND attempt = $2 AND stage = $3 AND running = TRUE
            ",
        )
        .bind(&lease.channel_id)
        .bind(lease.attempt)
        .bind(stage.as_i32())
        .bind(stage.next().as_i32())
        .execute(pool)
        .await
        .context("failed to complete stage attempt")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn clear_running(pool: &PgPool, channel_id: &str) -> Result<()> {
        sqlx::query("UPDATE channels SET running = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(channel_id)
            .execute(pool)
            .await
            .context("failed to clear running flag")?;
        Ok(())
    }

    pub async fn release_attempt(pool: &PgPool, lease: &AttemptLease) -> Result<()> {
        sqlx::query(
            r"
            UPDATE channels SET running = FALSE, updated_at = NOW()
            WHERE id = $1 AND attempt = $2
            ",
        )
        .bind(&lease.channel_id)
        .bind(lease.attempt)
        .execute(pool)
        .await
        .context("failed to release stage attempt")?;
        Ok(())
    }

    pub async fn set_stage(pool: &PgPool, channel_id: &str, stage: Stage) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE channels
            SET stage = $2, progress = 0, updated_at = NOW()
            WHERE id = $1 AND running = FALSE
            ",
        )
        .bind(channel_id)
        .bind(stage.as_i32())
        .execute(pool)
        .await
        .context("failed to update stage")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_limit(pool: &PgPool, channel_id: &str, limit: i64) -> Result<()> {
        sqlx::query("UPDATE channels SET message_limit = $2, updated_at = NOW() WHERE id = $1")
            .bind(channel_id)
            .bind(limit)
            .execute(pool)
            .await
            .context("failed to update message limit")?;
        Ok(())
    }

    /// Deletes the output of `stage` and of every later stage, deepest tables first.
    pub async fn clear_stage_output(
        pool: &PgPool,
        lease: &AttemptLease,
        stage: Stage,
    ) -> Result<()> {
        let channel_id = lease.channel_id.as_str();
        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        hold_lease(&mut tx, lease).await?;

        match stage {
            Stage::Limit | Stage::Done => {}
            Stage::Alternates => {
                sqlx::query(
                    r"
                    DELETE FROM user_alternates a
                    WHERE a.channel_id = $1
                      AND NOT EXISTS (
                        SELECT 1 FROM channel_users cu
                        WHERE cu.channel_id = a.channel_id AND cu.user_id = a.user_id
                      )
                    ",
                )
                .bind(channel_id)
                .execute(&mut *tx)
                .await
                .context("failed to delete stale alternates")?;
            }
            Stage::Gather | Stage::Cluster | Stage::Coref | Stage::Sentiment => {
                delete_sentiments(&mut tx, channel_id).await?;
                if stage <= Stage::Coref {
                    delete_resolved(&mut tx, channel_id).await?;
                }
                if stage <= Stage::Cluster {
                    delete_clusters(&mut tx, channel_id).await?;
                }
                if stage == Stage::Gather {
                    delete_messages(&mut tx, channel_id).await?;
                }
            }
        }

        tx.commit().await.context("failed to commit stage clear")?;
        Ok(())
    }

    pub async fn upsert_channel_user(
        pool: &PgPool,
        lease: &AttemptLease,
        user: &User,
    ) -> Result<()> {
        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        hold_lease(&mut tx, lease).await?;

        sqlx::query(
            r"
            INSERT INTO users (id, username) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username, updated_at = NOW()
            ",
        )
        .bind(&user.id)
        .bind(&user.username)
        .execute(&mut *tx)
        .await
        .context("failed to upsert user")?;

        sqlx::query(
            r"
            INSERT INTO channel_users (channel_id, user_id) VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(&lease.channel_id)
        .bind(&user.id)
        .execute(&mut *tx)
        .await
        .context("failed to link user to channel")?;

        tx.commit().await.context("failed to commit channel user")?;
        Ok(())
    }

    pub async fn list_channel_users(pool: &PgPool, channel_id: &str) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r"
            SELECT u.id, u.username
            FROM channel_users cu
            JOIN users u ON u.id = cu.user_id
            WHERE cu.channel_id = $1
            ORDER BY u.id
            ",
        )
        .bind(channel_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch channel users")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(User {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
            });
        }
        Ok(items)
    }

    pub async fn add_alternates(pool: &PgPool, alternates: &[UserAlternate]) -> Result<()> {
        if alternates.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        for alternate in alternates {
            sqlx::query(
                r"
                INSERT INTO user_alternates (channel_id, user_id, name) VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(&alternate.channel_id)
            .bind(&alternate.user_id)
            .bind(&alternate.name)
            .execute(&mut *tx)
            .await
            .context("failed to insert alternate")?;
        }
        tx.commit().await.context("failed to commit alternates")?;
        Ok(())
    }

    pub async fn remove_alternates(pool: &PgPool, alternates: &[UserAlternate]) -> Result<()> {
        if alternates.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        for alternate in alternates {
            sqlx::query(
                "DELETE FROM user_alternates WHERE channel_id = $1 AND user_id = $2 AND name = $3",
            )
            .bind(&alternate.channel_id)
            .bind(&alternate.user_id)
            .bind(&alternate.name)
            .execute(&mut *tx)
            .await
            .context("failed to delete alternate")?;
        }
        tx.commit().await.context("failed to commit alternate removal")?;
        Ok(())
    }

    pub async fn list_alternates(pool: &PgPool, channel_id: &str) -> Result<Vec<UserAlternate>> {
        let rows = sqlx::query(
            r"
            SELECT channel_id, user_id, name
            FROM user_alternates
            WHERE channel_id = $1
            ORDER BY user_id, name
            ",
        )
        .bind(channel_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch alternates")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(UserAlternate {
                channel_id: row.try_get("channel_id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(items)
    }
}

async fn delete_sentiments(tx: &mut Transaction<'_, Postgres>, channel_id: &str) -> Result<()> {
    for table in ["user_sentiments", "message_sentiments"] {
        sqlx::query(&format!(
            r"
            DELETE FROM {table}
            WHERE message_id IN (SELECT id FROM messages WHERE channel_id = $1)
            "
        ))
        .bind(channel_id)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to clear {table}"))?;
    }
    Ok(())
}

async fn delete_resolved(tx: &mut Transaction<'_, Postgres>, channel_id: &str) -> Result<()> {
    sqlx::query(
        r"
        DELETE FROM resolved_messages
        WHERE cluster_id IN (SELECT id FROM message_clusters WHERE channel_id = $1)
        ",
    )
    .bind(channel_id)
    .execute(&mut **tx)
    .await
    .context("failed to clear resolved messages")?;
    Ok(())
}

async fn delete_clusters(tx: &mut Transaction<'_, Postgres>, channel_id: &str) -> Result<()> {
    sqlx::query(
        r"
        DELETE FROM cluster_messages
        WHERE cluster_id IN (SELECT id FROM message_clusters WHERE channel_id = $1)
        ",
    )
    .bind(channel_id)
    .execute(&mut **tx)
    .await
    .context("failed to clear cluster members")?;

    sqlx::query("DELETE FROM message_clusters WHERE channel_id = $1")
        .bind(channel_id)
        .execute(&mut **tx)
        .await
        .context("failed to clear clusters")?;
    Ok(())
}

async fn delete_messages(tx: &mut Transaction<'_, Postgres>, channel_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM messages WHERE channel_id = $1")
        .bind(channel_id)
        .execute(&mut **tx)
        .await
        .context("failed to clear messages")?;

    sqlx::query("DELETE FROM channel_users WHERE channel_id = $1")
        .bind(channel_id)
        .execute(&mut **tx)
        .await
        .context("failed to clear channel users")?;
    Ok(())
}
