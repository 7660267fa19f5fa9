//! Merchant directory and per-user overrides.
//!
//! The directory is read-only to the pipeline and cached process-wide for
//! 15 minutes: lazy init on first read, refresh on expiry, and never mutated
//! by request handlers. This is the only module-level state in the service.

use crate::detect::merchant::{DirectoryEntry, MerchantDirectory, UserOverride};
use parking_lot::RwLock;
use rocket_db_pools::sqlx::{self, PgPool};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DIRECTORY_TTL: Duration = Duration::from_secs(15 * 60);

static DIRECTORY_CACHE: RwLock<Option<(Instant, Arc<MerchantDirectory>)>> = RwLock::new(None);

async fn load_directory(pool: &PgPool) -> Result<MerchantDirectory, sqlx::Error> {
    let rows: Vec<(String, Vec<String>, Vec<String>, Vec<String>)> = sqlx::query_as(
        r#"SELECT canonical_name, sender_emails, sender_domains, keywords
           FROM merchant_directory
           ORDER BY canonical_name"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(MerchantDirectory {
        entries: rows
            .into_iter()
            .map(
                |(canonical_name, sender_emails, sender_domains, keywords)| DirectoryEntry {
                    canonical_name,
                    sender_emails,
                    sender_domains,
                    keywords,
                },
            )
            .collect(),
    })
}

/// Directory snapshot, served from the cache while fresh.
pub async fn cached_directory(pool: &PgPool) -> Result<Arc<MerchantDirectory>, sqlx::Error> {
    if let Some((loaded_at, directory)) = DIRECTORY_CACHE.read().as_ref() {
        if loaded_at.elapsed() < DIRECTORY_TTL {
            return Ok(directory.clone());
        }
    }

    let directory = Arc::new(load_directory(pool).await?);
    *DIRECTORY_CACHE.write() = Some((Instant::now(), directory.clone()));
    log::debug!(
        "merchant directory refreshed: {} entries",
        directory.entries.len()
    );
    Ok(directory)
}

/// All overrides for one user.
pub async fn load_overrides(
    pool: &PgPool,
    user_id: &str,
) -> Result<Vec<UserOverride>, sqlx::Error> {
    let rows: Vec<(Option<String>, Option<String>, String)> = sqlx::query_as(
        r#"SELECT sender_email, sender_domain, canonical_name
           FROM merchant_overrides
           WHERE user_id = $1"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(sender_email, sender_domain, canonical_name)| UserOverride {
            sender_email,
            sender_domain,
            canonical_name,
        })
        .collect())
}

/// Upsert a user override on the sender-email axis.
pub async fn upsert_email_override(
    pool: &PgPool,
    user_id: &str,
    sender_email: &str,
    canonical_name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO merchant_overrides (user_id, sender_email, canonical_name)
           VALUES ($1, $2, $3)
           ON CONFLICT (user_id, sender_email) WHERE sender_email IS NOT NULL
           DO UPDATE SET canonical_name = EXCLUDED.canonical_name"#,
    )
    .bind(user_id)
    .bind(sender_email.to_lowercase())
    .bind(canonical_name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Upsert a user override on the sender-domain axis.
pub async fn upsert_domain_override(
    pool: &PgPool,
    user_id: &str,
    sender_domain: &str,
    canonical_name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO merchant_overrides (user_id, sender_domain, canonical_name)
           VALUES ($1, $2, $3)
           ON CONFLICT (user_id, sender_domain) WHERE sender_domain IS NOT NULL
           DO UPDATE SET canonical_name = EXCLUDED.canonical_name"#,
    )
    .bind(user_id)
    .bind(sender_domain.to_lowercase())
    .bind(canonical_name)
    .execute(pool)
    .await?;
    Ok(())
}
