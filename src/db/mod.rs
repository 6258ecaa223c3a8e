mod posts;
mod repository;
mod rows;
mod schema;
mod subscriptions;

pub use repository::Repository;
pub use subscriptions::ScheduledSubscription;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::{NewFile, NewSubscription, TagCategory};
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_repo() -> (TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let repo = Repository::open(path.to_str().unwrap()).await.unwrap();
        repo.migrate().await.unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn source_registration_is_idempotent() {
        let (_dir, repo) = open_repo().await;
        let a = repo.ensure_source("example").await.unwrap();
        let b = repo.ensure_source("example").await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(repo.get_source_by_name("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn null_original_ids_do_not_collide() {
        let (_dir, repo) = open_repo().await;
        let source = repo.ensure_source("local").await.unwrap();
        let a = repo.insert_post(source.id, None).await.unwrap();
        let b = repo.insert_post(source.id, None).await.unwrap();
        assert_ne!(a.id, b.id);

        repo.insert_post(source.id, Some("7")).await.unwrap();
        let err = repo.insert_post(source.id, Some("7")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn tags_are_case_insensitive_per_category() {
        let (_dir, repo) = open_repo().await;
        let source = repo.ensure_source("example").await.unwrap();
        let a = repo
            .ensure_tag(source.id, TagCategory::Artist, "Someone")
            .await
            .unwrap();
        let b = repo
            .ensure_tag(source.id, TagCategory::Artist, "someone")
            .await
            .unwrap();
        let c = repo
            .ensure_tag(source.id, TagCategory::General, "someone")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn feed_entry_insert_is_idempotent() {
        let (_dir, repo) = open_repo().await;
        let source = repo.ensure_source("example").await.unwrap();
        let post = repo.insert_post(source.id, Some("42")).await.unwrap();
        let sub = repo
            .insert_subscription(NewSubscription {
                source_id: source.id,
                name: "all".into(),
                repr: Some("all".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(repo.add_feed_entry(sub.id, post.id, 42).await.unwrap());
        assert!(!repo.add_feed_entry(sub.id, post.id, 99).await.unwrap());

        let entries = repo.feed_entries(sub.id, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sort_index, 42);
    }

    #[tokio::test]
    async fn duplicate_subscription_repr_is_a_conflict() {
        let (_dir, repo) = open_repo().await;
        let source = repo.ensure_source("example").await.unwrap();
        let new = |name: &str| NewSubscription {
            source_id: source.id,
            name: name.into(),
            repr: Some("user:1".into()),
            ..Default::default()
        };
        repo.insert_subscription(new("first")).await.unwrap();
        let err = repo.insert_subscription(new("second")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn rollback_discards_uncommitted_rows() {
        let (_dir, repo) = open_repo().await;
        let source = repo.ensure_source("example").await.unwrap();

        repo.begin().await.unwrap();
        let post = repo.insert_post(source.id, Some("1")).await.unwrap();
        repo.insert_file(NewFile {
            remote_id: post.id,
            metadata: json!({"k": 1}).as_object().cloned().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
        repo.rollback().await.unwrap();

        assert!(repo.get_post(post.id).await.unwrap().is_none());
        assert!(repo.post_files(post.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedulable_subscriptions_need_a_plugin() {
        let (_dir, repo) = open_repo().await;
        let source = repo.ensure_source("example").await.unwrap();
        let plugin = repo
            .insert_plugin(source.id, "example", 1, Default::default())
            .await
            .unwrap();
        repo.insert_subscription(NewSubscription {
            source_id: source.id,
            plugin_id: Some(plugin.id),
            name: "with".into(),
            repr: Some("a".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        repo.insert_subscription(NewSubscription {
            source_id: source.id,
            name: "without".into(),
            repr: Some("b".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        let scheduled = repo.schedulable_subscriptions().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].subscription.name, "with");
        assert_eq!(scheduled[0].source_name, "example");
        assert_eq!(scheduled[0].plugin_name, "example");
    }
}
