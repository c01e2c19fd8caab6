use chrono::{Duration, TimeZone, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};

use scribe::config::Config;
use scribe::entities::posts::PostStatus;
use scribe::entities::subscription_history::HistoryAction;
use scribe::entities::subscriptions::SubscriptionStatus;
use scribe::entities::{pinned_posts, posts, prelude::*, users};
use scribe::feed::{self, DateTime, FeedOrdering, FeedScope};
use scribe::models::WebhookPayload;
use scribe::payments::{self, WebhookOutcome};
use scribe::{db, pins, subscriptions, ApiError};

fn at(day: u32, hour: u32) -> DateTime {
    Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap()
}

async fn database() -> DatabaseConnection {
    let config = Config::default();
    db::init(&config.database, &config.subscriptions).await.unwrap()
}

async fn user(db: &DatabaseConnection, name: &str) -> users::Model {
    let now = at(1, 0);
    users::ActiveModel {
        username: Set(name.into()),
        email: Set(format!("{name}@example.com")),
        password_hash: Set(String::new()),
        first_name: Set(String::new()),
        last_name: Set(String::new()),
        bio: Set(String::new()),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}

async fn post(db: &DatabaseConnection, author: &users::Model, slug: &str, created: DateTime) -> posts::Model {
    posts::ActiveModel {
        title: Set(slug.into()),
        slug: Set(slug.into()),
        content: Set("body".into()),
        category_id: Set(None),
        author_id: Set(author.id),
        status: Set(PostStatus::Published),
        created_at: Set(created),
        updated_at: Set(created),
        views_count: Set(0),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}

/// Active subscription from `start` for the default plan's 30 days.
async fn subscribe(db: &DatabaseConnection, user: &users::Model, start: DateTime) {
    let plan = subscriptions::active_plans(db).await.unwrap().remove(0);
    let pending = scribe::entities::subscriptions::ActiveModel {
        user_id: Set(user.id),
        plan_id: Set(plan.id),
        status: Set(SubscriptionStatus::Pending),
        start_date: Set(start),
        end_date: Set(start),
        auto_renew: Set(true),
        created_at: Set(start),
        updated_at: Set(start),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap();
    subscriptions::activate(db, pending, &plan, None, start).await.unwrap();
}

async fn main_feed(db: &DatabaseConnection, now: DateTime) -> Vec<String> {
    feed::load_feed(db, FeedScope::Main { viewer: None }, FeedOrdering::PinAware, now)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.post.slug)
        .collect()
}

async fn ordered_feed(db: &DatabaseConnection, ordering: &str, now: DateTime) -> Vec<String> {
    let ordering = FeedOrdering::parse(Some(ordering));
    feed::load_feed(db, FeedScope::Main { viewer: None }, ordering, now)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.post.slug)
        .collect()
}

async fn pins_of(db: &DatabaseConnection, user: &users::Model) -> u64 {
    PinnedPosts::find()
        .filter(pinned_posts::Column::UserId.eq(user.id))
        .count(db)
        .await
        .unwrap()
}

#[tokio::test]
async fn pinned_post_leads_the_feed() {
    let db = database().await;
    let alice = user(&db, "alice").await;
    post(&db, &alice, "older", at(2, 9)).await;
    post(&db, &alice, "newer", at(3, 9)).await;
    subscribe(&db, &alice, at(4, 0)).await;

    let now = at(5, 0);
    assert_eq!(main_feed(&db, now).await, vec!["newer", "older"]);

    let outcome = pins::toggle(&db, &alice, "older", now).await.unwrap();
    assert!(outcome.is_pinned);
    assert_eq!(main_feed(&db, now).await, vec!["older", "newer"]);
}

#[tokio::test]
async fn second_pin_replaces_the_first() {
    let db = database().await;
    let alice = user(&db, "alice").await;
    post(&db, &alice, "p1", at(2, 9)).await;
    let p2 = post(&db, &alice, "p2", at(2, 10)).await;
    subscribe(&db, &alice, at(3, 0)).await;

    pins::toggle(&db, &alice, "p1", at(5, 0)).await.unwrap();
    let second = pins::toggle(&db, &alice, "p2", at(5, 1)).await.unwrap();
    assert!(second.is_pinned);

    let pinned = feed::load_pinned(&db, at(5, 2)).await.unwrap();
    assert_eq!(pinned.len(), 1);
    assert_eq!(pinned[0].post.id, p2.id);
    assert_eq!(pins_of(&db, &alice).await, 1);
}

#[tokio::test]
async fn double_toggle_returns_to_unpinned() {
    let db = database().await;
    let alice = user(&db, "alice").await;
    post(&db, &alice, "p1", at(2, 9)).await;
    subscribe(&db, &alice, at(3, 0)).await;

    assert!(pins::toggle(&db, &alice, "p1", at(5, 0)).await.unwrap().is_pinned);
    assert!(!pins::toggle(&db, &alice, "p1", at(5, 1)).await.unwrap().is_pinned);
    assert_eq!(pins_of(&db, &alice).await, 0);
}

#[tokio::test]
async fn pin_without_subscription_is_forbidden() {
    let db = database().await;
    let bob = user(&db, "bob").await;
    post(&db, &bob, "mine", at(2, 9)).await;

    let err = pins::toggle(&db, &bob, "mine", at(5, 0)).await.unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(ref msg) if msg == pins::SUBSCRIPTION_REQUIRED));
    assert_eq!(pins_of(&db, &bob).await, 0);
}

#[tokio::test]
async fn foreign_or_missing_post_is_not_found() {
    let db = database().await;
    let alice = user(&db, "alice").await;
    let bob = user(&db, "bob").await;
    post(&db, &alice, "alices", at(2, 9)).await;
    subscribe(&db, &bob, at(3, 0)).await;

    let err = pins::toggle(&db, &bob, "alices", at(5, 0)).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
    let err = pins::toggle(&db, &bob, "nowhere", at(5, 0)).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn lapsed_pin_ranks_by_creation() {
    let db = database().await;
    let carol = user(&db, "carol").await;
    post(&db, &carol, "p3", at(2, 9)).await;
    post(&db, &carol, "later", at(2, 12)).await;
    subscribe(&db, &carol, at(1, 0)).await;
    pins::toggle(&db, &carol, "p3", at(5, 0)).await.unwrap();

    // 30 days from June 1st.
    let after = at(1, 0) + Duration::days(30) + Duration::minutes(1);
    assert_eq!(main_feed(&db, at(5, 1)).await, vec!["p3", "later"]);
    assert_eq!(main_feed(&db, after).await, vec!["later", "p3"]);
    assert!(feed::load_pinned(&db, after).await.unwrap().is_empty());
    assert_eq!(pins_of(&db, &carol).await, 1);
}

#[tokio::test]
async fn expiry_sweep_keeps_pins() {
    let db = database().await;
    let dave = user(&db, "dave").await;
    post(&db, &dave, "kept", at(2, 9)).await;
    subscribe(&db, &dave, at(1, 0)).await;
    pins::toggle(&db, &dave, "kept", at(5, 0)).await.unwrap();

    let after = at(1, 0) + Duration::days(31);
    assert_eq!(subscriptions::expire_due(&db, at(5, 0)).await.unwrap(), 0);
    assert_eq!(subscriptions::expire_due(&db, after).await.unwrap(), 1);
    assert_eq!(subscriptions::expire_due(&db, after).await.unwrap(), 0);

    let sub = subscriptions::for_user(&db, dave.id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert_eq!(pins_of(&db, &dave).await, 1);

    let history = subscriptions::history(&db, sub.id).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn renewal_extends_the_period() {
    let db = database().await;
    let erin = user(&db, "erin").await;
    subscribe(&db, &erin, at(1, 0)).await;

    let plan = subscriptions::active_plans(&db).await.unwrap().remove(0);
    let current = subscriptions::for_user(&db, erin.id).await.unwrap().unwrap();
    let first_end = current.end_date;
    let renewed = subscriptions::activate(&db, current, &plan, None, at(10, 0))
        .await
        .unwrap();
    assert_eq!(renewed.end_date, first_end + Duration::days(30));
    assert_eq!(renewed.start_date, at(1, 0));
}

#[tokio::test]
async fn cancel_releases_the_pin() {
    let db = database().await;
    let frank = user(&db, "frank").await;
    post(&db, &frank, "mine", at(2, 9)).await;
    subscribe(&db, &frank, at(1, 0)).await;
    pins::toggle(&db, &frank, "mine", at(5, 0)).await.unwrap();

    let cancelled = subscriptions::cancel(&db, frank.id, at(6, 0)).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert!(!cancelled.auto_renew);
    assert_eq!(pins_of(&db, &frank).await, 0);

    let again = subscriptions::cancel(&db, frank.id, at(6, 1)).await.unwrap_err();
    assert!(matches!(again, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn explicit_ordering_ignores_pins() {
    let db = database().await;
    let gina = user(&db, "gina").await;
    post(&db, &gina, "b-old", at(2, 9)).await;
    post(&db, &gina, "a-new", at(3, 9)).await;
    subscribe(&db, &gina, at(1, 0)).await;
    pins::toggle(&db, &gina, "b-old", at(5, 0)).await.unwrap();

    let now = at(5, 1);
    assert_eq!(main_feed(&db, now).await, vec!["b-old", "a-new"]);

    assert_eq!(ordered_feed(&db, "title", now).await, vec!["a-new", "b-old"]);
    assert_eq!(ordered_feed(&db, "-updated_at", now).await, vec!["a-new", "b-old"]);

    pins::toggle(&db, &gina, "a-new", at(5, 2)).await.unwrap();
    assert_eq!(ordered_feed(&db, "-title", at(5, 3)).await, vec!["b-old", "a-new"]);
    assert_eq!(main_feed(&db, at(5, 3)).await, vec!["a-new", "b-old"]);
}

fn event(id: &str, kind: &str, payment_id: i32) -> WebhookPayload {
    WebhookPayload {
        event_id: id.into(),
        event_type: kind.into(),
        payment_id,
        reason: Some("card declined".into()),
    }
}

#[tokio::test]
async fn late_failure_keeps_a_paid_subscription() {
    let db = database().await;
    let hank = user(&db, "hank").await;
    let plan = subscriptions::active_plans(&db).await.unwrap().remove(0);

    let (first, _) = payments::checkout(&db, &hank, plan.id, "EUR", at(1, 0)).await.unwrap();
    let (second, pending) = payments::checkout(&db, &hank, plan.id, "EUR", at(1, 1)).await.unwrap();
    assert_eq!(pending.status, SubscriptionStatus::Pending);

    let paid = event("evt-1", payments::PAYMENT_SUCCEEDED, first.id);
    let outcome = payments::handle_webhook(&db, &paid, serde_json::json!({}), at(1, 2)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);

    let failed = event("evt-2", payments::PAYMENT_FAILED, second.id);
    let outcome = payments::handle_webhook(&db, &failed, serde_json::json!({}), at(1, 3)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);

    let sub = subscriptions::for_user(&db, hank.id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.is_effective(at(1, 4)));

    let history = subscriptions::history(&db, sub.id).await.unwrap();
    assert!(history.iter().any(|h| h.action == HistoryAction::PaymentFailed));
}
