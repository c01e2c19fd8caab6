use serde::{Deserialize, Deserializer, Serialize};

use crate::entities::payments::PaymentStatus;
use crate::entities::posts::PostStatus;
use crate::entities::subscriptions::SubscriptionStatus;
use crate::entities::{categories, comments, payments, subscription_plans, subscriptions, users};
use crate::feed::DateTime;

/// Length at which list views cut post content.
pub const PREVIEW_CHARS: usize = 200;

/// Distinguishes an absent field from an explicit `null`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn preview(content: &str) -> String {
    match content.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

/// `999` -> `"9.99"`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}

// Accounts

#[derive(Debug, Deserialize)]
pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshInput {
    pub refresh: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordInput {
    pub old_password: String,
    pub new_password: String,
    pub new_password_confirm: String,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub bio: String,
    pub created_at: DateTime,
    pub posts_count: u64,
    pub comments_count: u64,
}

impl UserProfile {
    pub fn new(user: &users::Model, posts_count: u64, comments_count: u64) -> Self {
        UserProfile {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            full_name: user.full_name(),
            bio: user.bio.clone(),
            created_at: user.created_at,
            posts_count,
            comments_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorInfo {
    pub id: i32,
    pub username: String,
    pub full_name: String,
}

impl From<&users::Model> for AuthorInfo {
    fn from(user: &users::Model) -> Self {
        AuthorInfo {
            id: user.id,
            username: user.username.clone(),
            full_name: user.full_name(),
        }
    }
}

// Categories

#[derive(Debug, Deserialize)]
pub struct CategoryInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CategoryUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CategoryOut {
    pub id: i32,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub posts_count: u64,
    pub created_at: DateTime,
}

impl CategoryOut {
    pub fn new(category: &categories::Model, posts_count: u64) -> Self {
        CategoryOut {
            id: category.id,
            name: category.name.clone(),
            slug: category.slug.clone(),
            description: category.description.clone(),
            posts_count,
            created_at: category.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryInfo {
    pub id: i32,
    pub name: String,
    pub slug: String,
}

impl From<&categories::Model> for CategoryInfo {
    fn from(category: &categories::Model) -> Self {
        CategoryInfo {
            id: category.id,
            name: category.name.clone(),
            slug: category.slug.clone(),
        }
    }
}

// Posts

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub ordering: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PostInput {
    pub title: String,
    pub content: String,
    pub category: Option<i32>,
    pub status: Option<PostStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PostUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub category: Option<Option<i32>>,
    pub status: Option<PostStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinnedBy {
    pub id: i32,
    pub username: String,
    pub has_active_subscription: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinnedInfo {
    pub is_pinned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_by: Option<PinnedBy>,
}

impl PinnedInfo {
    pub fn unpinned() -> Self {
        PinnedInfo {
            is_pinned: false,
            pinned_at: None,
            pinned_by: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PostSummary {
    pub id: i32,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub category: Option<String>,
    pub author: String,
    pub status: PostStatus,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub views_count: i32,
    pub comments_count: u64,
    pub is_pinned: bool,
    pub pinned_info: PinnedInfo,
}

#[derive(Debug, Serialize)]
pub struct PostDetail {
    #[serde(flatten)]
    pub summary: PostSummary,
    pub category_info: Option<CategoryInfo>,
    pub author_info: Option<AuthorInfo>,
    pub can_pin: bool,
}

#[derive(Debug, Serialize)]
pub struct PostBrief {
    pub id: i32,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub views_count: i32,
    pub created_at: DateTime,
}

impl From<&crate::entities::posts::Model> for PostBrief {
    fn from(post: &crate::entities::posts::Model) -> Self {
        PostBrief {
            id: post.id,
            title: post.title.clone(),
            slug: post.slug.clone(),
            content: preview(&post.content),
            views_count: post.views_count,
            created_at: post.created_at,
        }
    }
}

// Comments

#[derive(Debug, Deserialize)]
pub struct CommentInput {
    pub post: i32,
    pub content: String,
    pub parent: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CommentUpdate {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct CommentOut {
    pub id: i32,
    pub post: i32,
    pub author: String,
    pub author_info: Option<AuthorInfo>,
    pub parent: Option<i32>,
    pub content: String,
    pub is_active: bool,
    pub is_reply: bool,
    pub replies_count: u64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<CommentOut>>,
}

impl CommentOut {
    pub fn new(comment: &comments::Model, author: Option<&users::Model>, replies_count: u64) -> Self {
        CommentOut {
            id: comment.id,
            post: comment.post_id,
            author: author.map(|a| a.username.clone()).unwrap_or_default(),
            author_info: author.map(AuthorInfo::from),
            parent: comment.parent_id,
            content: comment.content.clone(),
            is_active: comment.is_active,
            is_reply: comment.is_reply(),
            replies_count,
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            replies: None,
        }
    }
}

// Subscriptions

#[derive(Debug, Deserialize)]
pub struct PinPostInput {
    pub post_id: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanOut {
    pub id: i32,
    pub name: String,
    pub price: String,
    pub price_cents: i64,
    pub duration_days: i32,
    pub features: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime,
}

impl From<&subscription_plans::Model> for PlanOut {
    fn from(plan: &subscription_plans::Model) -> Self {
        PlanOut {
            id: plan.id,
            name: plan.name.clone(),
            price: format_cents(plan.price_cents),
            price_cents: plan.price_cents,
            duration_days: plan.duration_days,
            features: plan.features.clone(),
            is_active: plan.is_active,
            created_at: plan.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub id: i32,
    pub username: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionOut {
    pub id: i32,
    pub user: i32,
    pub user_info: UserInfo,
    pub plan: i32,
    pub plan_info: Option<PlanOut>,
    pub status: SubscriptionStatus,
    pub start_date: DateTime,
    pub end_date: DateTime,
    pub auto_renew: bool,
    pub is_active: bool,
    pub days_remaining: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl SubscriptionOut {
    pub fn new(
        subscription: &subscriptions::Model,
        user: &users::Model,
        plan: Option<&subscription_plans::Model>,
        now: DateTime,
    ) -> Self {
        SubscriptionOut {
            id: subscription.id,
            user: subscription.user_id,
            user_info: UserInfo {
                id: user.id,
                username: user.username.clone(),
                full_name: user.full_name(),
                email: user.email.clone(),
            },
            plan: subscription.plan_id,
            plan_info: plan.map(PlanOut::from),
            status: subscription.status,
            start_date: subscription.start_date,
            end_date: subscription.end_date,
            auto_renew: subscription.auto_renew,
            is_active: subscription.is_effective(now),
            days_remaining: subscription.days_remaining(now),
            created_at: subscription.created_at,
            updated_at: subscription.updated_at,
        }
    }
}

// Payments

#[derive(Debug, Deserialize)]
pub struct CheckoutInput {
    pub plan_id: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event_id: String,
    pub event_type: String,
    pub payment_id: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentOut {
    pub id: i32,
    pub subscription: Option<i32>,
    pub amount: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub processed_at: Option<DateTime>,
}

impl From<&payments::Model> for PaymentOut {
    fn from(payment: &payments::Model) -> Self {
        PaymentOut {
            id: payment.id,
            subscription: payment.subscription_id,
            amount: format_cents(payment.amount_cents),
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            status: payment.status,
            payment_method: payment.payment_method.clone(),
            description: payment.description.clone(),
            metadata: payment.metadata.clone(),
            created_at: payment.created_at,
            updated_at: payment.updated_at,
            processed_at: payment.processed_at,
        }
    }
}
