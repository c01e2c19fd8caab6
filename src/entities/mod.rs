pub mod categories;
pub mod comments;
pub mod payments;
pub mod pinned_posts;
pub mod posts;
pub mod subscription_history;
pub mod subscription_plans;
pub mod subscriptions;
pub mod users;
pub mod webhook_events;

pub mod prelude {
    pub use super::categories::Entity as Categories;
    pub use super::comments::Entity as Comments;
    pub use super::payments::Entity as Payments;
    pub use super::pinned_posts::Entity as PinnedPosts;
    pub use super::posts::Entity as Posts;
    pub use super::subscription_history::Entity as SubscriptionHistory;
    pub use super::subscription_plans::Entity as SubscriptionPlans;
    pub use super::subscriptions::Entity as Subscriptions;
    pub use super::users::Entity as Users;
    pub use super::webhook_events::Entity as WebhookEvents;
}
