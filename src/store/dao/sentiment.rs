use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use super::channel::hold_lease;
use crate::store::models::{AttemptLease, MessageSentiment, UserSentiment};

pub(crate) struct SentimentQueries;

impl SentimentQueries {
    /// Stores one sentiment unit. Either every row of the unit lands or none does.
    pub async fn insert_sentiments(
        pool: &PgPool,
        lease: &AttemptLease,
        messages: &[MessageSentiment],
        users: &[UserSentiment],
    ) -> Result<()> {
        if messages.is_empty() && users.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        hold_lease(&mut tx, lease).await?;

        for sentiment in messages {
            sqlx::query(
                r"
                INSERT INTO message_sentiments (message_id, score, magnitude)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(&sentiment.message_id)
            .bind(sentiment.score)
            .bind(sentiment.magnitude)
            .execute(&mut *tx)
            .await
            .context("failed to insert message sentiment")?;
        }

        for sentiment in users {
            sqlx::query(
                r"
                INSERT INTO user_sentiments
                    (message_id, object_user_id, subject_user_id, score, magnitude)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(&sentiment.message_id)
            .bind(&sentiment.object_user_id)
            .bind(&sentiment.subject_user_id)
            .bind(sentiment.score)
            .bind(sentiment.magnitude)
            .execute(&mut *tx)
            .await
            .context("failed to insert user sentiment")?;
        }

        tx.commit().await.context("failed to commit sentiments")?;
        Ok(())
    }

    pub async fn list_message_sentiments(
        pool: &PgPool,
        channel_id: &str,
    ) -> Result<Vec<MessageSentiment>> {
        let rows = sqlx::query(
            r"
            SELECT s.message_id, s.score, s.magnitude
            FROM message_sentiments s
            JOIN messages m ON m.id = s.message_id
            WHERE m.channel_id = $1
            ORDER BY s.id ASC
            ",
        )
        .bind(channel_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch message sentiments")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(MessageSentiment {
                message_id: row.try_get("message_id")?,
                score: row.try_get("score")?,
                magnitude: row.try_get("magnitude")?,
            });
        }
        Ok(items)
    }

    pub async fn list_user_sentiments(
        pool: &PgPool,
        channel_id: &str,
    ) -> Result<Vec<UserSentiment>> {
        let rows = sqlx::query(
            r"
            SELECT s.message_id, s.object_user_id, s.subject_user_id, s.score, s.magnitude
            FROM user_sentiments s
            JOIN messages m ON m.id = s.message_id
            WHERE m.channel_id = $1
            ORDER BY s.id ASC
            ",
        )
        .bind(channel_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch user sentiments")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(UserSentiment {
                message_id: row.try_get("message_id")?,
                object_user_id: row.try_get("object_user_id")?,
                subject_user_id: row.try_get("subject_user_id")?,
                score: row.try_get("score")?,
                magnitude: row.try_get("magnitude")?,
            });
        }
        Ok(items)
    }
}
