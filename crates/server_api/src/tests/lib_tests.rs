use super::*;
use crate::test_support::{context, user};
use shared::error::ErrorCode;

#[test]
fn chat_errors_map_to_wire_codes() {
    let cases = [
        (ChatError::ChatNotFound, ErrorCode::NotFound),
        (ChatError::UserNotFound, ErrorCode::NotFound),
        (ChatError::NotAuthorized("no"), ErrorCode::Forbidden),
        (ChatError::invalid("bad"), ErrorCode::Validation),
        (
            ChatError::Storage(anyhow::anyhow!("disk on fire")),
            ErrorCode::Internal,
        ),
    ];
    for (err, code) in cases {
        let api: ApiError = err.into();
        assert_eq!(api.code, code);
    }

    let api: ApiError = ChatError::Storage(anyhow::anyhow!("secret path")).into();
    assert!(!api.message.contains("secret path"));
}

#[tokio::test]
async fn profile_and_public_keys() {
    let ctx = context().await;
    let alice = user(&ctx, "alice").await;

    let me = profile(&ctx, alice.user_id).await.expect("profile");
    assert_eq!(me.email, "alice@x.com");
    assert!(me.public_key.is_none());

    let err = save_public_key(&ctx, alice.user_id, "   ")
        .await
        .expect_err("blank key");
    assert!(matches!(err, ChatError::InvalidInput(_)));

    save_public_key(&ctx, alice.user_id, "pk-alice")
        .await
        .expect("save");
    let key = public_key_for(&ctx, alice.user_id).await.expect("key");
    assert_eq!(key.public_key, "pk-alice");

    let err = public_key_for(&ctx, UserId(999))
        .await
        .expect_err("missing user");
    assert!(matches!(err, ChatError::UserNotFound));
}

#[tokio::test]
async fn search_matches_username_or_email() {
    let ctx = context().await;
    user(&ctx, "alice").await;
    user(&ctx, "bob").await;

    let found = search_users(&ctx, "ali").await.expect("search");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].username, "alice");

    let by_email = search_users(&ctx, "x.com").await.expect("search");
    assert_eq!(by_email.len(), 2);

    let err = search_users(&ctx, " ").await.expect_err("blank");
    assert!(matches!(err, ChatError::InvalidInput(_)));
}
