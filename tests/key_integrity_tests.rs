mod common;

use anyhow::Result;
use common::TestEnvironment;
use flocksync::storage::Entity;
use flocksync::sync::Role;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_cache_survives_restart() -> Result<()> {
    let env = TestEnvironment::new().await?;

    {
        let ctx = env.context().await?;
        ctx.store
            .save(Entity::Users, &[json!({ "id": 4, "name": "Ana" })], Role::Pastor)
            .await?;
        ctx.teardown().await;
    }

    let ctx = env.context().await?;
    let user = ctx.store.get(Entity::Users, "4").await?.expect("cached user");
    assert_eq!(user.value["name"], json!("Ana"));

    Ok(())
}

#[tokio::test]
async fn test_corrupted_sentinel_purges_cache() -> Result<()> {
    let env = TestEnvironment::new().await?;
    let ctx = env.context().await?;

    ctx.store
        .save(Entity::Tasks, &[json!({ "id": 1 }), json!({ "id": 2 })], Role::Admin)
        .await?;
    assert_eq!(ctx.db.count_cache("tasks").await?, 2);

    ctx.keys.clear_key().await;
    ctx.db.set_meta("key_sentinel", "bm90IGEgcmVhbCBzZW50aW5lbA==").await?;

    ctx.keys.get_or_create_key().await?;
    assert_eq!(ctx.db.count_cache("tasks").await?, 0);

    // The fresh sentinel holds on the next derivation
    ctx.store.save(Entity::Tasks, &[json!({ "id": 3 })], Role::Admin).await?;
    ctx.keys.clear_key().await;
    ctx.keys.get_or_create_key().await?;
    assert_eq!(ctx.db.count_cache("tasks").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_logout_keeps_cache_readable_after_login() -> Result<()> {
    let env = TestEnvironment::new().await?;
    let ctx = env.context().await?;

    ctx.login(5, Role::Pastor).await;
    ctx.store
        .save(Entity::Messages, &[json!({ "id": "m1", "body": "Hi" })], Role::Pastor)
        .await?;

    ctx.logout().await;
    assert!(!ctx.keys.has_active_key().await);
    assert!(!ctx.session.is_authenticated().await);

    ctx.login(5, Role::Pastor).await;
    let message = ctx.store.get(Entity::Messages, "m1").await?.expect("cached message");
    assert_eq!(message.value["body"], json!("Hi"));

    Ok(())
}

#[tokio::test]
async fn test_rotation_discards_old_cache() -> Result<()> {
    let env = TestEnvironment::new().await?;
    let ctx = env.context().await?;

    ctx.store
        .save(Entity::Events, &[json!({ "id": 1 })], Role::SuperAdmin)
        .await?;
    let before = ctx.keys.key_version().await?;

    let key = ctx.keys.rotate_key().await?;
    assert_eq!(key.version(), before + 1);
    assert_eq!(ctx.db.count_cache("events").await?, 0);

    Ok(())
}
