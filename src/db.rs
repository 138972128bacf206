use chrono::NaiveDateTime;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::notify::{Level, Notification};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Persist a drained batch of notifications for `cohort`.
pub async fn insert_notifications(
    pool: &PgPool,
    cohort: &str,
    notifications: &[Notification],
) -> anyhow::Result<usize> {
    let mut inserted = 0usize;

    for notification in notifications {
        let result = sqlx::query(
            r#"
            INSERT INTO cohort_flow.notifications
            (id, cohort, level, message, raised_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(cohort)
        .bind(notification.level.as_str())
        .bind(&notification.message)
        .bind(notification.raised_at)
        .execute(pool)
        .await?;

        inserted += result.rows_affected() as usize;
    }

    Ok(inserted)
}

#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub cohort: String,
    pub notification: Notification,
}

pub async fn fetch_recent(
    pool: &PgPool,
    cohort: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<StoredNotification>> {
    let mut query = String::from(
        "SELECT cohort, level, message, raised_at \
         FROM cohort_flow.notifications",
    );
    if cohort.is_some() {
        query.push_str(" WHERE cohort = $2");
    }
    query.push_str(" ORDER BY raised_at DESC LIMIT $1");

    let mut rows = sqlx::query(&query).bind(limit);
    if let Some(value) = cohort {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut notifications = Vec::with_capacity(records.len());

    for row in records {
        let level: String = row.get("level");
        let raised_at: NaiveDateTime = row.get("raised_at");
        notifications.push(StoredNotification {
            cohort: row.get("cohort"),
            notification: Notification {
                level: Level::parse(&level).unwrap_or(Level::Info),
                message: row.get("message"),
                raised_at,
            },
        });
    }

    Ok(notifications)
}
