use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter};

use crate::entities::{posts, prelude::*};

/// Lowercases `text`, keeps letters and digits and joins the remaining
/// words with single hyphens.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;

    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.extend(c.to_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_hyphen = true;
        }
    }
    slug
}

/// A post slug derived from `title` that no other post uses. Collisions get
/// `-1`, `-2`, ... appended. `exclude` is the post being renamed, if any.
pub async fn unique_post_slug<C>(db: &C, title: &str, exclude: Option<i32>) -> Result<String, DbErr>
where
    C: ConnectionTrait,
{
    let base = match slugify(title) {
        s if s.is_empty() => "post".to_string(),
        s => s,
    };

    let mut candidate = base.clone();
    let mut suffix = 1;
    loop {
        let mut query = Posts::find().filter(posts::Column::Slug.eq(candidate.as_str()));
        if let Some(id) = exclude {
            query = query.filter(posts::Column::Id.ne(id));
        }
        if query.count(db).await? == 0 {
            return Ok(candidate);
        }
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
}
