//! Route table of the `/api/v1` surface.

use crate::handlers::{accounts, categories, comments, health, payments, posts, subscriptions};
use crate::http::Server;
use crate::state::AppState;

pub const API_PREFIX: &str = "/api/v1";

pub fn build(state: AppState) -> Server {
    Server::new()
        .prefix(API_PREFIX)
        .cors()
        .with_state(state)
        .get("/health", health)
        // accounts
        .post("/auth/register", accounts::register)
        .post("/auth/login", accounts::login)
        .post("/auth/token/refresh", accounts::refresh)
        .get("/auth/profile", accounts::get_profile)
        .patch("/auth/profile", accounts::update_profile)
        .post("/auth/change-password", accounts::change_password)
        // posts
        .get("/posts", posts::list)
        .post("/posts", posts::create)
        .get("/posts/my-posts", posts::my_posts)
        .get("/posts/popular", posts::popular)
        .get("/posts/recent", posts::recent)
        .get("/posts/pinned", posts::pinned)
        .get("/posts/featured", posts::featured)
        .get("/posts/categories", categories::list)
        .post("/posts/categories", categories::create)
        .get("/posts/categories/:slug", categories::detail)
        .patch("/posts/categories/:slug", categories::update)
        .delete("/posts/categories/:slug", categories::delete)
        .get("/posts/categories/:slug/posts", categories::posts)
        .get("/posts/:slug", posts::detail)
        .patch("/posts/:slug", posts::update)
        .delete("/posts/:slug", posts::delete)
        .post("/posts/:slug/toggle-pin", posts::toggle_pin)
        // comments
        .get("/comments", comments::list)
        .post("/comments", comments::create)
        .get("/comments/my-comments", comments::my_comments)
        .get("/comments/post/:post_id", comments::post_comments)
        .get("/comments/:id", comments::detail)
        .patch("/comments/:id", comments::update)
        .delete("/comments/:id", comments::delete)
        .get("/comments/:id/replies", comments::replies)
        // subscriptions
        .get("/subscribe/plans", subscriptions::plans)
        .get("/subscribe/plans/:id", subscriptions::plan_detail)
        .get("/subscribe/my-subscription", subscriptions::my_subscription)
        .get("/subscribe/status", subscriptions::status)
        .get("/subscribe/history", subscriptions::history)
        .get("/subscribe/pinned-posts", subscriptions::pinned_posts)
        .get("/subscribe/can-pin/:post_id", subscriptions::can_pin)
        .post("/subscribe/cancel", subscriptions::cancel)
        .post("/subscribe/pin-post", subscriptions::pin_post)
        .post("/subscribe/unpin-post", subscriptions::unpin_post)
        .get("/subscribe/pinned-post", subscriptions::pinned_post)
        .delete("/subscribe/pinned-post", subscriptions::unpin_post)
        // payments
        .get("/payment/payments", payments::list)
        .get("/payment/payments/:id", payments::detail)
        .get("/payment/payments/:id/status", payments::status)
        .post("/payment/payments/:id/cancel", payments::cancel)
        .post("/payment/payments/:id/retry", payments::retry)
        .post("/payment/checkout", payments::checkout)
        .post("/payment/webhook", payments::webhook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::entities::{pinned_posts, posts as post, prelude::*, subscriptions as subscription};
    use crate::http::test::TestClient;
    use crate::http::StatusCode;
    use chrono::{Duration, Utc};
    use sea_orm::{
        ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, Set,
    };
    use serde_json::{json, Value};

    const SECRET: &str = "webhook-test-secret";

    async fn setup() -> (TestClient, AppState) {
        let mut config = Config::default();
        config.payments.webhook_secret = SECRET.into();
        let db = db::init(&config.database, &config.subscriptions)
            .await
            .unwrap();
        let state = AppState::new(db, config);
        (TestClient::new(build(state.clone())), state)
    }

    fn api(path: &str) -> String {
        format!("{API_PREFIX}{path}")
    }

    async fn register(client: &TestClient, name: &str) -> String {
        let res = client
            .post(&api("/auth/register"))
            .json(&json!({
                "username": name,
                "email": format!("{name}@example.com"),
                "password": "correct horse",
                "password_confirm": "correct horse",
            }))
            .send()
            .await;
        res.assert_created();
        res.json()["access"].as_str().unwrap().to_string()
    }

    async fn create_post(client: &TestClient, token: &str, title: &str) -> Value {
        let res = client
            .post(&api("/posts"))
            .bearer(token)
            .json(&json!({ "title": title, "content": "Some body text" }))
            .send()
            .await;
        res.assert_created();
        res.json()
    }

    /// Checkout plus a successful provider callback.
    async fn subscribe(client: &TestClient, token: &str) {
        let plans = client.get(&api("/subscribe/plans")).send().await.json();
        let plan_id = plans[0]["id"].as_i64().unwrap();

        let checkout = client
            .post(&api("/payment/checkout"))
            .bearer(token)
            .json(&json!({ "plan_id": plan_id }))
            .send()
            .await;
        checkout.assert_created();
        let payment_id = checkout.json()["payment"]["id"].as_i64().unwrap();

        let hook = client
            .post(&api("/payment/webhook"))
            .header("X-Webhook-Secret", SECRET)
            .json(&json!({
                "event_id": format!("evt-{payment_id}"),
                "event_type": "payment.succeeded",
                "payment_id": payment_id,
            }))
            .send()
            .await;
        hook.assert_ok();
        assert_eq!(hook.json()["status"], "processed");
    }

    async fn toggle(client: &TestClient, token: &str, slug: &str) -> Value {
        let res = client
            .post(&api(&format!("/posts/{slug}/toggle-pin")))
            .bearer(token)
            .send()
            .await;
        res.assert_ok();
        res.json()
    }

    async fn feed_slugs(client: &TestClient) -> Vec<String> {
        let feed = client.get(&api("/posts")).send().await.json();
        feed["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["slug"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn health_and_unknown_routes() {
        let (client, _) = setup().await;
        client.get(&api("/health")).send().await.assert_ok();
        client.get(&api("/nope")).send().await.assert_not_found();
        client
            .put(&api("/posts"))
            .send()
            .await
            .assert_status(StatusCode::MethodNotAllowed);
    }

    #[tokio::test]
    async fn register_login_and_profile() {
        let (client, _) = setup().await;
        register(&client, "alice").await;

        let duplicate = client
            .post(&api("/auth/register"))
            .json(&json!({
                "username": "alice",
                "email": "alice@example.com",
                "password": "correct horse",
                "password_confirm": "correct horse",
            }))
            .send()
            .await;
        duplicate.assert_status(StatusCode::Conflict);

        let mismatch = client
            .post(&api("/auth/register"))
            .json(&json!({
                "username": "bob",
                "email": "bob@example.com",
                "password": "correct horse",
                "password_confirm": "battery staple",
            }))
            .send()
            .await;
        mismatch.assert_bad_request();
        assert!(mismatch.json()["fields"]["password_confirm"].is_array());

        let login = client
            .post(&api("/auth/login"))
            .json(&json!({ "email": "ALICE@example.com", "password": "correct horse" }))
            .send()
            .await;
        login.assert_ok();
        let body = login.json();
        let access = body["access"].as_str().unwrap();

        client
            .post(&api("/auth/login"))
            .json(&json!({ "email": "alice@example.com", "password": "wrong" }))
            .send()
            .await
            .assert_unauthorized();

        let refreshed = client
            .post(&api("/auth/token/refresh"))
            .json(&json!({ "refresh": body["refresh"] }))
            .send()
            .await;
        refreshed.assert_ok();

        let profile = client.get(&api("/auth/profile")).bearer(access).send().await;
        profile.assert_ok();
        assert_eq!(profile.json()["username"], "alice");
        assert_eq!(profile.json()["posts_count"], 0);

        client.get(&api("/auth/profile")).send().await.assert_unauthorized();
        // A refresh token is not an access token.
        client
            .get(&api("/auth/profile"))
            .bearer(body["refresh"].as_str().unwrap())
            .send()
            .await
            .assert_unauthorized();
    }

    #[tokio::test]
    async fn pin_requires_active_subscription() {
        let (client, state) = setup().await;
        let token = register(&client, "bob").await;
        let post = create_post(&client, &token, "Unsubscribed").await;

        let res = client
            .post(&api(&format!("/posts/{}/toggle-pin", post["slug"].as_str().unwrap())))
            .bearer(&token)
            .send()
            .await;
        res.assert_forbidden();
        res.assert_body_contains("Active subscription required");

        assert_eq!(PinnedPosts::find().count(&state.db).await.unwrap(), 0);
        let pinned = client.get(&api("/posts/pinned")).send().await.json();
        assert_eq!(pinned["count"], 0);
    }

    #[tokio::test]
    async fn pinning_replaces_previous_pin_and_toggles_back() {
        let (client, state) = setup().await;
        let token = register(&client, "alice").await;
        let p1 = create_post(&client, &token, "First").await;
        let p2 = create_post(&client, &token, "Second").await;
        let _p3 = create_post(&client, &token, "Third").await;
        subscribe(&client, &token).await;

        let first = toggle(&client, &token, "first").await;
        assert_eq!(first["is_pinned"], true);
        assert_eq!(first["message"], "Post pinned successfully");
        assert_eq!(feed_slugs(&client).await[0], "first");

        let second = toggle(&client, &token, "second").await;
        assert_eq!(second["is_pinned"], true);
        assert_eq!(second["post"]["id"], p2["id"]);

        let feed = feed_slugs(&client).await;
        assert_eq!(feed, vec!["second", "third", "first"]);
        assert_eq!(PinnedPosts::find().count(&state.db).await.unwrap(), 1);

        let detail = client.get(&api("/posts/first")).send().await.json();
        assert_eq!(detail["id"], p1["id"]);
        assert_eq!(detail["is_pinned"], false);

        let off = toggle(&client, &token, "second").await;
        assert_eq!(off["is_pinned"], false);
        assert_eq!(off["message"], "Post unpinned successfully");
        assert_eq!(PinnedPosts::find().count(&state.db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lapsed_subscription_demotes_pin() {
        let (client, state) = setup().await;
        let token = register(&client, "carol").await;
        create_post(&client, &token, "Old pinned").await;
        create_post(&client, &token, "Newer").await;
        subscribe(&client, &token).await;
        toggle(&client, &token, "old-pinned").await;
        assert_eq!(feed_slugs(&client).await[0], "old-pinned");

        let sub = Subscriptions::find().one(&state.db).await.unwrap().unwrap();
        let mut lapsed: subscription::ActiveModel = sub.into_active_model();
        lapsed.end_date = Set(Utc::now() - Duration::minutes(1));
        lapsed.update(&state.db).await.unwrap();

        let feed = client.get(&api("/posts")).send().await.json();
        assert_eq!(feed["pinned_posts_count"], 0);
        assert_eq!(feed["results"][0]["slug"], "newer");
        let old = &feed["results"][1];
        assert_eq!(old["is_pinned"], false);
        assert_eq!(old["pinned_info"]["pinned_by"]["has_active_subscription"], false);

        // The record survives the lapse.
        let pins: Vec<pinned_posts::Model> = PinnedPosts::find().all(&state.db).await.unwrap();
        assert_eq!(pins.len(), 1);
        let status = client.get(&api("/subscribe/status")).bearer(&token).send().await.json();
        assert_eq!(status["is_active"], false);
        assert!(status["pinned_post"].is_null());
    }

    #[tokio::test]
    async fn cancel_releases_pin() {
        let (client, state) = setup().await;
        let token = register(&client, "dave").await;
        create_post(&client, &token, "Mine").await;
        subscribe(&client, &token).await;
        toggle(&client, &token, "mine").await;

        let res = client.post(&api("/subscribe/cancel")).bearer(&token).send().await;
        res.assert_ok();
        assert_eq!(res.json()["subscription"]["status"], "cancelled");
        assert_eq!(PinnedPosts::find().count(&state.db).await.unwrap(), 0);

        client
            .post(&api("/subscribe/cancel"))
            .bearer(&token)
            .send()
            .await
            .assert_bad_request();

        let history = client.get(&api("/subscribe/history")).bearer(&token).send().await.json();
        let actions: Vec<&str> = history
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["action"].as_str().unwrap())
            .collect();
        assert_eq!(actions, vec!["cancelled", "activated", "created"]);
    }

    #[tokio::test]
    async fn webhook_is_authenticated_and_idempotent() {
        let (client, _) = setup().await;
        let token = register(&client, "erin").await;
        let plans = client.get(&api("/subscribe/plans")).send().await.json();
        let checkout = client
            .post(&api("/payment/checkout"))
            .bearer(&token)
            .json(&json!({ "plan_id": plans[0]["id"] }))
            .send()
            .await
            .json();
        let payment_id = checkout["payment"]["id"].clone();
        let event = json!({
            "event_id": "evt-1",
            "event_type": "payment.failed",
            "payment_id": payment_id,
            "reason": "card_declined",
        });

        client
            .post(&api("/payment/webhook"))
            .header("X-Webhook-Secret", "wrong")
            .json(&event)
            .send()
            .await
            .assert_unauthorized();

        let first = client
            .post(&api("/payment/webhook"))
            .header("X-Webhook-Secret", SECRET)
            .json(&event)
            .send()
            .await;
        assert_eq!(first.json()["status"], "processed");
        let replay = client
            .post(&api("/payment/webhook"))
            .header("X-Webhook-Secret", SECRET)
            .json(&event)
            .send()
            .await;
        assert_eq!(replay.json()["status"], "duplicate");

        let path = api(&format!("/payment/payments/{payment_id}/status"));
        let status = client.get(&path).bearer(&token).send().await.json();
        assert_eq!(status["status"], "failed");
        assert_eq!(status["subscription_status"], "inactive");

        let retry = client
            .post(&api(&format!("/payment/payments/{payment_id}/retry")))
            .bearer(&token)
            .send()
            .await;
        retry.assert_created();
        assert_eq!(retry.json()["payment"]["status"], "pending");
    }

    #[tokio::test]
    async fn drafts_stay_private() {
        let (client, _) = setup().await;
        let author = register(&client, "frank").await;
        let reader = register(&client, "grace").await;
        client
            .post(&api("/posts"))
            .bearer(&author)
            .json(&json!({ "title": "Draft", "content": "wip", "status": "draft" }))
            .send()
            .await
            .assert_created();

        assert!(feed_slugs(&client).await.is_empty());
        client.get(&api("/posts/draft")).send().await.assert_not_found();
        client.get(&api("/posts/draft")).bearer(&reader).send().await.assert_not_found();
        client.get(&api("/posts/draft")).bearer(&author).send().await.assert_ok();

        let own = client.get(&api("/posts")).bearer(&author).send().await.json();
        assert_eq!(own["count"], 1);

        client
            .patch(&api("/posts/draft"))
            .bearer(&reader)
            .json(&json!({ "title": "Hijacked" }))
            .send()
            .await
            .assert_forbidden();
    }

    #[tokio::test]
    async fn category_feed_counts_pins() {
        let (client, _) = setup().await;
        let token = register(&client, "heidi").await;
        let category = client
            .post(&api("/posts/categories"))
            .bearer(&token)
            .json(&json!({ "name": "Rust Tips" }))
            .send()
            .await;
        category.assert_created();
        let category_id = category.json()["id"].clone();
        assert_eq!(category.json()["slug"], "rust-tips");

        client
            .post(&api("/posts"))
            .bearer(&token)
            .json(&json!({ "title": "Borrowing", "content": "...", "category": category_id }))
            .send()
            .await
            .assert_created();
        subscribe(&client, &token).await;
        toggle(&client, &token, "borrowing").await;

        let res = client.get(&api("/posts/categories/rust-tips/posts")).send().await;
        res.assert_ok();
        let body = res.json();
        assert_eq!(body["pinned_posts_count"], 1);
        assert_eq!(body["category"]["posts_count"], 1);
        assert_eq!(body["posts"][0]["category"], "Rust Tips");

        client
            .get(&api("/posts/categories/missing/posts"))
            .send()
            .await
            .assert_not_found();
    }

    #[tokio::test]
    async fn comments_thread_and_soft_delete() {
        let (client, _) = setup().await;
        let token = register(&client, "ivan").await;
        let post = create_post(&client, &token, "Discussed").await;
        let post_id = post["id"].clone();

        let top = client
            .post(&api("/comments"))
            .bearer(&token)
            .json(&json!({ "post": post_id, "content": "First!" }))
            .send()
            .await;
        top.assert_created();
        let top_id = top.json()["id"].clone();

        client
            .post(&api("/comments"))
            .bearer(&token)
            .json(&json!({ "post": post_id, "content": "Reply", "parent": top_id }))
            .send()
            .await
            .assert_created();

        let thread = client
            .get(&api(&format!("/comments/post/{post_id}")))
            .send()
            .await
            .json();
        assert_eq!(thread["comments_count"], 1);
        assert_eq!(thread["comments"][0]["replies_count"], 1);
        assert_eq!(thread["comments"][0]["replies"][0]["content"], "Reply");

        let detail = client.get(&api("/posts/discussed")).send().await.json();
        assert_eq!(detail["comments_count"], 2);

        client
            .delete(&api(&format!("/comments/{top_id}")))
            .bearer(&token)
            .send()
            .await
            .assert_status(StatusCode::NoContent);
        client
            .get(&api(&format!("/comments/{top_id}")))
            .send()
            .await
            .assert_not_found();
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let (client, _) = setup().await;
        let res = client.options(&api("/posts")).send().await;
        assert!(res.header("Access-Control-Allow-Origin").is_some());
    }

    #[tokio::test]
    async fn explicit_ordering_ignores_pins() {
        let (client, _) = setup().await;
        let token = register(&client, "gina").await;
        create_post(&client, &token, "Zebra notes").await;
        create_post(&client, &token, "Apple notes").await;
        subscribe(&client, &token).await;
        toggle(&client, &token, "zebra-notes").await;
        assert_eq!(feed_slugs(&client).await, vec!["zebra-notes", "apple-notes"]);

        let feed = client.get(&api("/posts?ordering=title")).send().await.json();
        let slugs: Vec<&str> = feed["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["slug"].as_str().unwrap())
            .collect();
        assert_eq!(slugs, vec!["apple-notes", "zebra-notes"]);
        assert_eq!(feed["results"][1]["is_pinned"], true);
    }

    #[tokio::test]
    async fn featured_splits_pinned_and_recent() {
        let (client, state) = setup().await;
        let token = register(&client, "hana").await;
        create_post(&client, &token, "Stale").await;
        create_post(&client, &token, "Fresh").await;
        create_post(&client, &token, "Pinned one").await;
        subscribe(&client, &token).await;
        toggle(&client, &token, "pinned-one").await;

        let stale = Posts::find()
            .filter(post::Column::Slug.eq("stale"))
            .one(&state.db)
            .await
            .unwrap()
            .unwrap();
        let mut aged: post::ActiveModel = stale.into_active_model();
        aged.created_at = Set(Utc::now() - Duration::days(10));
        aged.update(&state.db).await.unwrap();

        let res = client.get(&api("/posts/featured")).send().await;
        res.assert_ok();
        let featured = res.json();
        assert_eq!(featured["total_pinned"], 1);
        assert_eq!(featured["pinned_posts"][0]["slug"], "pinned-one");
        let popular: Vec<&str> = featured["popular_posts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["slug"].as_str().unwrap())
            .collect();
        assert_eq!(popular, vec!["fresh"]);
    }
}
