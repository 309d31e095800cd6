use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::channel::hold_lease;
use crate::store::models::{
    AttemptLease, ClusterMember, Message, MessageCluster, ResolvedMessage,
};

pub(crate) struct MessageQueries;

impl MessageQueries {
    pub async fn insert_message(
        pool: &PgPool,
        lease: &AttemptLease,
        message: &Message,
    ) -> Result<bool> {
        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        hold_lease(&mut tx, lease).await?;

        let result = sqlx::query(
            r"
            INSERT INTO messages (id, channel_id, author_id, content, sent_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&message.id)
        .bind(&message.channel_id)
        .bind(&message.author_id)
        .bind(&message.content)
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await
        .context("failed to insert message")?;

        tx.commit().await.context("failed to commit message")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_messages(pool: &PgPool, channel_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r"
            SELECT id, channel_id, author_id, content, sent_at
            FROM messages
            WHERE channel_id = $1
            ORDER BY sent_at ASC, id ASC
            ",
        )
        .bind(channel_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch messages")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let timestamp: DateTime<Utc> = row.try_get("sent_at")?;
            items.push(Message {
                id: row.try_get("id")?,
                channel_id: row.try_get("channel_id")?,
                author_id: row.try_get("author_id")?,
                content: row.try_get("content")?,
                timestamp,
            });
        }
        Ok(items)
    }

    /// Inserts a cluster and its members in one transaction, returning the cluster id.
    pub async fn insert_cluster(
        pool: &PgPool,
        lease: &AttemptLease,
        position: i32,
        message_ids: &[String],
    ) -> Result<i64> {
        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        hold_lease(&mut tx, lease).await?;

        let cluster_id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO message_clusters (channel_id, position)
            VALUES ($1, $2)
            RETURNING id
            ",
        )
        .bind(&lease.channel_id)
        .bind(position)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert cluster")?;

        for (member_position, message_id) in message_ids.iter().enumerate() {
            let member_position = i32::try_from(member_position)
                .context("cluster member position does not fit in i32")?;
            sqlx::query(
                r"
                INSERT INTO cluster_messages (cluster_id, message_id, position)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(cluster_id)
            .bind(message_id)
            .bind(member_position)
            .execute(&mut *tx)
            .await
            .context("failed to insert cluster member")?;
        }

        tx.commit().await.context("failed to commit cluster")?;
        Ok(cluster_id)
    }

    pub async fn list_clusters(pool: &PgPool, channel_id: &str) -> Result<Vec<MessageCluster>> {
        let rows = sqlx::query(
            r"
            SELECT c.id AS cluster_id, c.position AS cluster_position,
                   m.id AS message_id, m.author_id, m.content,
                   COALESCE(u.username, '') AS speaker
            FROM message_clusters c
            JOIN cluster_messages cm ON cm.cluster_id = c.id
            JOIN messages m ON m.id = cm.message_id
            LEFT JOIN users u ON u.id = m.author_id
            WHERE c.channel_id = $1
            ORDER BY c.position ASC, cm.position ASC
            ",
        )
        .bind(channel_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch clusters")?;

        let mut clusters: Vec<MessageCluster> = Vec::new();
        for row in rows {
            let cluster_id: i64 = row.try_get("cluster_id")?;
            let member = ClusterMember {
                message_id: row.try_get("message_id")?,
                author_id: row.try_get("author_id")?,
                speaker: row.try_get("speaker")?,
                content: row.try_get("content")?,
            };
            match clusters.last_mut() {
                Some(cluster) if cluster.id == cluster_id => cluster.members.push(member),
                _ => clusters.push(MessageCluster {
                    id: cluster_id,
                    channel_id: channel_id.to_string(),
                    position: row.try_get("cluster_position")?,
                    members: vec![member],
                }),
            }
        }
        Ok(clusters)
    }

    pub async fn insert_resolved(
        pool: &PgPool,
        lease: &AttemptLease,
        cluster_id: i64,
        resolved: &[ResolvedMessage],
    ) -> Result<()> {
        if resolved.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await.context("failed to begin transaction")?;
        hold_lease(&mut tx, lease).await?;
        for message in resolved {
            sqlx::query(
                r"
                INSERT INTO resolved_messages (message_id, cluster_id, content)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(&message.message_id)
            .bind(cluster_id)
            .bind(&message.content)
            .execute(&mut *tx)
            .await
            .context("failed to insert resolved message")?;
        }
        tx.commit()
            .await
            .context("failed to commit resolved messages")?;
        Ok(())
    }

    pub async fn list_resolved(pool: &PgPool, channel_id: &str) -> Result<Vec<ResolvedMessage>> {
        let rows = sqlx::query(
            r"
            SELECT r.message_id, m.author_id, r.content
            FROM resolved_messages r
            JOIN message_clusters c ON c.id = r.cluster_id
            JOIN cluster_messages cm ON cm.message_id = r.message_id
            JOIN messages m ON m.id = r.message_id
            WHERE c.channel_id = $1
            ORDER BY c.position ASC, cm.position ASC
            ",
        )
        .bind(channel_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch resolved messages")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(ResolvedMessage {
                message_id: row.try_get("message_id")?,
                author_id: row.try_get("author_id")?,
                content: row.try_get("content")?,
            });
        }
        Ok(items)
    }
}
