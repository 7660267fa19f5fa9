//! Schema migrations, run on startup. Idempotent: already-applied
//! migrations are tracked and skipped by SQLx.

use rocket_db_pools::sqlx::PgPool;

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

    log::info!("database migrations completed");
    Ok(())
}
