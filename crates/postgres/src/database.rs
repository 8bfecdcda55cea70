use sqlx::{PgPool, Row};

/// Default connection string when `DATABASE_URL` is unset.
const DEFAULT_DATABASE_URL: &str = "postgres://localhost/vacation_rentals";

/// Creates a connection pool to the PostgreSQL database.
pub async fn create_connection_pool() -> Result<PgPool, sqlx::Error> {
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

    PgPool::connect(&database_url).await
}

/// Tests the database connection by executing a simple query.
pub async fn test_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS count FROM properties")
        .fetch_one(pool)
        .await?;

    let property_count: i64 = row.try_get("count")?;
    log::info!(
        "Database connection successful, {} properties on record",
        property_count
    );

    Ok(())
}
