//! Feed ranking.
//!
//! Posts with an effective pin come first, most recently pinned first, then
//! every other post newest first. Whether a pin is effective depends on the
//! pin owner's subscription at `now`, so it is computed on every read from
//! the pin and subscription rows loaded next to the candidate posts.

use std::cmp::Ordering;
use std::collections::HashMap;

use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, Select,
};

use crate::entities::posts::PostStatus;
use crate::entities::{pinned_posts, posts, prelude::*, subscriptions};

pub type DateTime = chrono::DateTime<chrono::Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    ViewsCount,
    Title,
}

impl SortField {
    fn column(self) -> posts::Column {
        match self {
            SortField::CreatedAt => posts::Column::CreatedAt,
            SortField::UpdatedAt => posts::Column::UpdatedAt,
            SortField::ViewsCount => posts::Column::ViewsCount,
            SortField::Title => posts::Column::Title,
        }
    }
}

/// How a post list is ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrdering {
    /// Effective pins first, then newest first.
    PinAware,
    /// Plain sort on one column; pins get no special treatment.
    Field { field: SortField, descending: bool },
}

impl FeedOrdering {
    /// Reads the `ordering` query parameter. Unknown values fall back to a
    /// plain newest-first sort.
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = raw.map(str::trim).unwrap_or_default();
        if matches!(raw, "" | "-created_at" | "created_at") {
            return FeedOrdering::PinAware;
        }

        let (name, descending) = match raw.strip_prefix('-') {
            Some(name) => (name, true),
            None => (raw, false),
        };
        let field = match name {
            "updated_at" => SortField::UpdatedAt,
            "views_count" => SortField::ViewsCount,
            "title" => SortField::Title,
            _ => {
                return FeedOrdering::Field {
                    field: SortField::CreatedAt,
                    descending: true,
                }
            }
        };
        FeedOrdering::Field { field, descending }
    }

    fn apply(self, query: Select<Posts>) -> Select<Posts> {
        let (column, descending) = match self {
            FeedOrdering::PinAware => (posts::Column::CreatedAt, true),
            FeedOrdering::Field { field, descending } => (field.column(), descending),
        };
        let query = if descending {
            query.order_by_desc(column)
        } else {
            query.order_by_asc(column)
        };
        query.order_by_desc(posts::Column::Id)
    }
}

/// Which posts are candidates for a feed.
#[derive(Debug, Clone, Copy)]
pub enum FeedScope {
    /// Published posts, plus the viewer's own drafts.
    Main { viewer: Option<i32> },
    /// Published posts of one category.
    Category(i32),
    /// Every post of one author, drafts included.
    Author(i32),
}

/// A pin record together with its owner's subscription, if any.
#[derive(Debug, Clone)]
pub struct PinInfo {
    pub record: pinned_posts::Model,
    pub subscription: Option<subscriptions::Model>,
}

impl PinInfo {
    pub fn is_effective(&self, now: DateTime) -> bool {
        is_effective_pin(&self.record, self.subscription.as_ref(), now)
    }

    pub fn owner_has_active_subscription(&self, now: DateTime) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|s| s.is_effective(now))
    }
}

#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub post: posts::Model,
    pub pin: Option<PinInfo>,
}

impl FeedEntry {
    /// `pinned_at` of the post's pin when that pin is effective.
    pub fn effective_pinned_at(&self, now: DateTime) -> Option<DateTime> {
        self.pin
            .as_ref()
            .filter(|pin| pin.is_effective(now))
            .map(|pin| pin.record.pinned_at)
    }

    pub fn is_pinned(&self, now: DateTime) -> bool {
        self.effective_pinned_at(now).is_some()
    }
}

/// A pin counts only while its owner's subscription is active and unexpired.
pub fn is_effective_pin(
    pin: &pinned_posts::Model,
    subscription: Option<&subscriptions::Model>,
    now: DateTime,
) -> bool {
    subscription.is_some_and(|s| s.user_id == pin.user_id && s.is_effective(now))
}

fn compare(a: &FeedEntry, b: &FeedEntry, now: DateTime) -> Ordering {
    let pins = match (a.effective_pinned_at(now), b.effective_pinned_at(now)) {
        (Some(pa), Some(pb)) => pb.cmp(&pa),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    pins.then_with(|| b.post.created_at.cmp(&a.post.created_at))
        .then_with(|| b.post.id.cmp(&a.post.id))
}

/// Sorts entries into feed order.
pub fn rank(entries: &mut [FeedEntry], now: DateTime) {
    entries.sort_by(|a, b| compare(a, b, now));
}

/// Number of entries in the effective pinned tier.
pub fn pinned_count(entries: &[FeedEntry], now: DateTime) -> usize {
    entries.iter().filter(|e| e.is_pinned(now)).count()
}

/// Pairs each post with its pin record and the pin owner's subscription.
pub async fn attach_pins<C>(db: &C, posts: Vec<posts::Model>) -> Result<Vec<FeedEntry>, DbErr>
where
    C: ConnectionTrait,
{
    if posts.is_empty() {
        return Ok(Vec::new());
    }

    let post_ids: Vec<i32> = posts.iter().map(|p| p.id).collect();
    let pins = PinnedPosts::find()
        .filter(pinned_posts::Column::PostId.is_in(post_ids))
        .all(db)
        .await?;
    let subscriptions = owner_subscriptions(db, &pins).await?;

    let mut pins: HashMap<i32, pinned_posts::Model> =
        pins.into_iter().map(|pin| (pin.post_id, pin)).collect();

    Ok(posts
        .into_iter()
        .map(|post| {
            let pin = pins.remove(&post.id).map(|record| PinInfo {
                subscription: subscriptions.get(&record.user_id).cloned(),
                record,
            });
            FeedEntry { post, pin }
        })
        .collect())
}

async fn owner_subscriptions<C>(
    db: &C,
    pins: &[pinned_posts::Model],
) -> Result<HashMap<i32, subscriptions::Model>, DbErr>
where
    C: ConnectionTrait,
{
    if pins.is_empty() {
        return Ok(HashMap::new());
    }
    let owners: Vec<i32> = pins.iter().map(|p| p.user_id).collect();
    let rows = Subscriptions::find()
        .filter(subscriptions::Column::UserId.is_in(owners))
        .all(db)
        .await?;
    Ok(rows.into_iter().map(|s| (s.user_id, s)).collect())
}

/// Loads the candidate posts of `scope` and orders them.
pub async fn load_feed<C>(
    db: &C,
    scope: FeedScope,
    ordering: FeedOrdering,
    now: DateTime,
) -> Result<Vec<FeedEntry>, DbErr>
where
    C: ConnectionTrait,
{
    let query = match scope {
        FeedScope::Main { viewer: None } => {
            Posts::find().filter(posts::Column::Status.eq(PostStatus::Published))
        }
        FeedScope::Main {
            viewer: Some(user_id),
        } => Posts::find().filter(
            posts::Column::Status
                .eq(PostStatus::Published)
                .or(posts::Column::AuthorId.eq(user_id)),
        ),
        FeedScope::Category(category_id) => Posts::find()
            .filter(posts::Column::Status.eq(PostStatus::Published))
            .filter(posts::Column::CategoryId.eq(category_id)),
        FeedScope::Author(author_id) => {
            Posts::find().filter(posts::Column::AuthorId.eq(author_id))
        }
    };

    let posts = ordering.apply(query).all(db).await?;
    let mut entries = attach_pins(db, posts).await?;
    if ordering == FeedOrdering::PinAware {
        rank(&mut entries, now);
    }
    Ok(entries)
}

/// Published posts whose pin is effective, in pinned-tier order.
pub async fn load_pinned<C>(db: &C, now: DateTime) -> Result<Vec<FeedEntry>, DbErr>
where
    C: ConnectionTrait,
{
    let pins = PinnedPosts::find().all(db).await?;
    if pins.is_empty() {
        return Ok(Vec::new());
    }

    let post_ids: Vec<i32> = pins.iter().map(|p| p.post_id).collect();
    let posts = Posts::find()
        .filter(posts::Column::Id.is_in(post_ids))
        .filter(posts::Column::Status.eq(PostStatus::Published))
        .all(db)
        .await?;

    let mut entries = attach_pins(db, posts).await?;
    entries.retain(|e| e.is_pinned(now));
    rank(&mut entries, now);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::subscriptions::SubscriptionStatus;
    use chrono::{Duration, TimeZone, Utc};

    fn at(hour: u32) -> DateTime {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn post(id: i32, author_id: i32, created: DateTime) -> posts::Model {
        posts::Model {
            id,
            title: format!("Post {id}"),
            slug: format!("post-{id}"),
            content: String::new(),
            category_id: None,
            author_id,
            status: PostStatus::Published,
            created_at: created,
            updated_at: created,
            views_count: 0,
        }
    }

    fn subscription(user_id: i32, status: SubscriptionStatus, end: DateTime) -> subscriptions::Model {
        subscriptions::Model {
            id: user_id,
            user_id,
            plan_id: 1,
            status,
            start_date: end - Duration::days(30),
            end_date: end,
            auto_renew: true,
            created_at: end - Duration::days(30),
            updated_at: end - Duration::days(30),
        }
    }

    fn pinned(entry_post: posts::Model, pinned_at: DateTime, sub: Option<subscriptions::Model>) -> FeedEntry {
        FeedEntry {
            pin: Some(PinInfo {
                record: pinned_posts::Model {
                    id: entry_post.id,
                    user_id: entry_post.author_id,
                    post_id: entry_post.id,
                    pinned_at,
                },
                subscription: sub,
            }),
            post: entry_post,
        }
    }

    fn plain(p: posts::Model) -> FeedEntry {
        FeedEntry { post: p, pin: None }
    }

    fn ids(entries: &[FeedEntry]) -> Vec<i32> {
        entries.iter().map(|e| e.post.id).collect()
    }

    #[test]
    fn ordering_parameter() {
        assert_eq!(FeedOrdering::parse(None), FeedOrdering::PinAware);
        assert_eq!(FeedOrdering::parse(Some("")), FeedOrdering::PinAware);
        assert_eq!(FeedOrdering::parse(Some("-created_at")), FeedOrdering::PinAware);
        assert_eq!(FeedOrdering::parse(Some("created_at")), FeedOrdering::PinAware);
        assert_eq!(
            FeedOrdering::parse(Some("-views_count")),
            FeedOrdering::Field {
                field: SortField::ViewsCount,
                descending: true
            }
        );
        assert_eq!(
            FeedOrdering::parse(Some("title")),
            FeedOrdering::Field {
                field: SortField::Title,
                descending: false
            }
        );
        assert_eq!(
            FeedOrdering::parse(Some("bogus")),
            FeedOrdering::Field {
                field: SortField::CreatedAt,
                descending: true
            }
        );
    }

    #[test]
    fn effective_pin_requires_active_unexpired_subscription() {
        let now = at(12);
        let pin = pinned_posts::Model {
            id: 1,
            user_id: 1,
            post_id: 1,
            pinned_at: at(1),
        };
        let active = subscription(1, SubscriptionStatus::Active, now + Duration::days(1));
        let expired = subscription(1, SubscriptionStatus::Active, now);
        let cancelled = subscription(1, SubscriptionStatus::Cancelled, now + Duration::days(1));
        let someone_else = subscription(2, SubscriptionStatus::Active, now + Duration::days(1));

        assert!(is_effective_pin(&pin, Some(&active), now));
        assert!(!is_effective_pin(&pin, Some(&expired), now));
        assert!(!is_effective_pin(&pin, Some(&cancelled), now));
        assert!(!is_effective_pin(&pin, Some(&someone_else), now));
        assert!(!is_effective_pin(&pin, None, now));
    }

    #[test]
    fn pins_lead_most_recent_first() {
        let now = at(23);
        let live = |user| Some(subscription(user, SubscriptionStatus::Active, now + Duration::days(5)));

        let mut entries = vec![
            plain(post(1, 9, at(10))),
            pinned(post(2, 2, at(1)), at(5), live(2)),
            plain(post(3, 9, at(20))),
            pinned(post(4, 4, at(2)), at(8), live(4)),
        ];
        rank(&mut entries, now);

        assert_eq!(ids(&entries), vec![4, 2, 3, 1]);
        assert_eq!(pinned_count(&entries, now), 2);
    }

    #[test]
    fn lapsed_pin_ranks_by_creation_time() {
        let now = at(23);
        let lapsed = Some(subscription(3, SubscriptionStatus::Active, at(22)));

        let mut entries = vec![
            pinned(post(3, 3, at(5)), at(21), lapsed),
            plain(post(1, 9, at(10))),
            plain(post(2, 9, at(4))),
        ];
        rank(&mut entries, now);

        assert_eq!(ids(&entries), vec![1, 3, 2]);
        assert_eq!(pinned_count(&entries, now), 0);
        assert!(entries[1].pin.is_some());
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let now = at(23);
        let mut entries = vec![
            plain(post(1, 9, at(10))),
            plain(post(3, 9, at(10))),
            plain(post(2, 9, at(10))),
        ];
        rank(&mut entries, now);
        assert_eq!(ids(&entries), vec![3, 2, 1]);
    }
}
