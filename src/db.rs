use crate::config::{DatabaseConfig, SubscriptionConfig};
use crate::entities::{prelude::*, subscription_plans};
use chrono::Utc;
use std::time::Duration;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, Schema, Set,
};

const MEMORY_CONNECTION_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.url.clone());
    options.sqlx_logging(false);
    if config.url.contains(":memory:") {
        // Every connection to an in-memory database sees its own empty
        // database, so the pool holds exactly one that never expires.
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(MEMORY_CONNECTION_LIFETIME)
            .max_lifetime(MEMORY_CONNECTION_LIFETIME);
    }

    tracing::info!(url = %config.url, "connecting to database");
    Database::connect(options).await
}

/// Creates every table that does not exist yet.
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut statements = vec![
        schema.create_table_from_entity(Users),
        schema.create_table_from_entity(Categories),
        schema.create_table_from_entity(Posts),
        schema.create_table_from_entity(Comments),
        schema.create_table_from_entity(SubscriptionPlans),
        schema.create_table_from_entity(Subscriptions),
        schema.create_table_from_entity(SubscriptionHistory),
        schema.create_table_from_entity(PinnedPosts),
        schema.create_table_from_entity(Payments),
        schema.create_table_from_entity(WebhookEvents),
    ];

    for stmt in statements.iter_mut() {
        stmt.if_not_exists();
        db.execute(backend.build(&*stmt)).await?;
    }
    Ok(())
}

/// Inserts the configured default plan when the plan table is empty.
pub async fn seed_default_plan(
    db: &DatabaseConnection,
    config: &SubscriptionConfig,
) -> Result<(), DbErr> {
    if SubscriptionPlans::find().count(db).await? > 0 {
        return Ok(());
    }

    let now = Utc::now();
    SubscriptionPlans::insert(subscription_plans::ActiveModel {
        name: Set(config.default_plan_name.clone()),
        price_cents: Set(config.default_plan_price_cents),
        duration_days: Set(config.default_plan_duration_days),
        features: Set(serde_json::json!(["Pin one post to the top of the feed"])),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    })
    .exec(db)
    .await?;

    tracing::info!(plan = %config.default_plan_name, "seeded default subscription plan");
    Ok(())
}

/// Connects, creates the schema and seeds the default plan.
pub async fn init(
    database: &DatabaseConfig,
    subscriptions: &SubscriptionConfig,
) -> Result<DatabaseConnection, DbErr> {
    let db = connect(database).await?;
    create_schema(&db).await?;
    seed_default_plan(&db, subscriptions).await?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn init_is_idempotent() {
        let config = Config::default();
        let db = init(&config.database, &config.subscriptions).await.unwrap();
        create_schema(&db).await.unwrap();
        seed_default_plan(&db, &config.subscriptions).await.unwrap();

        let plans = SubscriptionPlans::find().all(&db).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "Premium");
        assert_eq!(plans[0].price_cents, 999);
        assert_eq!(plans[0].duration_days, 30);
    }
}
