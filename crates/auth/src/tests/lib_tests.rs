use super::*;

async fn setup() -> (Authenticator, Storage, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let auth = Authenticator::new(
        storage.clone(),
        AuthConfig {
            jwt_secret: "test-secret".into(),
            ..AuthConfig::default()
        },
    );
    let alice = auth
        .register("alice", "alice@x.com", "correct horse")
        .await
        .expect("register");
    (auth, storage, alice)
}

#[tokio::test]
async fn successful_login_issues_verifiable_token() {
    let (auth, _storage, alice) = setup().await;
    let token = auth
        .authenticate("alice@x.com", "correct horse")
        .await
        .expect("login");
    let identity = auth.verify(&token).expect("verify");
    assert_eq!(identity.user_id, alice);
    assert_eq!(identity.username, "alice");
}

#[tokio::test]
async fn unknown_email_is_not_found() {
    let (auth, _, _) = setup().await;
    let err = auth
        .authenticate("nobody@x.com", "whatever")
        .await
        .expect_err("should fail");
    assert!(matches!(err, AuthError::NotFound));
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let (auth, _, _) = setup().await;
    let err = auth
        .register("alice", "other@x.com", "pw")
        .await
        .expect_err("should conflict");
    assert!(matches!(err, AuthError::Conflict));

    let err = auth
        .register("", "blank@x.com", "pw")
        .await
        .expect_err("should reject");
    assert!(matches!(err, AuthError::InvalidInput(_)));
}

#[tokio::test]
async fn concurrent_registrations_yield_one_conflict() {
    let (auth, _, _) = setup().await;
    let (first, second) = tokio::join!(
        auth.register("dora", "dora@x.com", "pw"),
        auth.register("dora2", "dora@x.com", "pw"),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(AuthError::Conflict))));
}

#[tokio::test]
async fn five_failures_lock_and_window_expiry_unlocks() {
    let (auth, storage, alice) = setup().await;
    let now = Utc::now();

    for _ in 0..4 {
        let err = auth
            .authenticate_at("alice@x.com", "wrong", now)
            .await
            .expect_err("wrong password");
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    let fifth = auth
        .authenticate_at("alice@x.com", "wrong", now)
        .await
        .expect_err("fifth failure");
    assert!(matches!(fifth, AuthError::Locked(_)));

    let sixth = auth
        .authenticate_at("alice@x.com", "correct horse", now + Duration::minutes(1))
        .await
        .expect_err("still locked");
    assert!(matches!(sixth, AuthError::Locked(_)));

    let token = auth
        .authenticate_at("alice@x.com", "correct horse", now + Duration::minutes(6))
        .await
        .expect("lock window elapsed");
    assert_eq!(auth.verify(&token).expect("verify").user_id, alice);

    let user = storage.user_by_id(alice).await.expect("load").expect("user");
    assert_eq!(user.failed_attempts, 0);
    assert!(user.locked_until.is_none());
}

#[tokio::test]
async fn tampered_or_foreign_tokens_are_invalid() {
    let (auth, storage, alice) = setup().await;
    let token = auth
        .authenticate("alice@x.com", "correct horse")
        .await
        .expect("login");

    let other = Authenticator::new(
        storage,
        AuthConfig {
            jwt_secret: "another-secret".into(),
            ..AuthConfig::default()
        },
    );
    assert!(matches!(other.verify(&token), Err(AuthError::Invalid)));
    assert!(matches!(auth.verify("not-a-token"), Err(AuthError::Invalid)));

    let keys = TokenKeys::from_secret(b"test-secret");
    let expired = mint_token(
        &keys,
        alice,
        "alice",
        Utc::now() - Duration::hours(48),
        Duration::hours(24),
    )
    .expect("mint");
    assert!(matches!(auth.verify(&expired), Err(AuthError::Invalid)));
}

#[test]
fn password_hash_round_trip() {
    let hash = hash_password("s3cret").expect("hash");
    assert!(verify_password("s3cret", &hash).expect("verify"));
    assert!(!verify_password("nope", &hash).expect("verify"));
}
