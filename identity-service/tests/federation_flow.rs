mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    begin, query_param, test_app, test_app_with, test_app_with_stores, test_config, IdTokenSpec,
    PROVIDER, REDIRECT_URI,
};
use identity_service::{
    models::{ClientMeta, FederatedIdentity, User},
    services::{FederationError, Registration},
    store::{IdentityStore, MemoryStore, StoreError, Stores, UnlinkOutcome, UserStore},
    utils::{pkce_challenge, Password},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn authorization_url_carries_pkce_parameters() {
    let app = test_app();
    let request = app
        .state
        .federation
        .begin_authorization(PROVIDER, REDIRECT_URI)
        .await
        .unwrap();

    let url = &request.auth_url;
    assert!(url.starts_with("https://id.acme.test/authorize?"));
    assert_eq!(query_param(url, "response_type").as_deref(), Some("code"));
    assert_eq!(query_param(url, "client_id").as_deref(), Some(common::CLIENT_ID));
    assert_eq!(query_param(url, "redirect_uri").as_deref(), Some(REDIRECT_URI));
    assert_eq!(query_param(url, "scope").as_deref(), Some("openid email profile"));
    assert_eq!(query_param(url, "code_challenge_method").as_deref(), Some("S256"));
    assert_eq!(query_param(url, "state").as_deref(), Some(request.state.as_str()));
    assert_eq!(request.state.len(), 43);
    assert_eq!(app.state.pkce.len(), 1);

    // The challenge sent out must match the verifier used in the exchange.
    let challenge = query_param(url, "code_challenge").unwrap();
    let nonce = query_param(url, "nonce").unwrap();
    app.gateway.script("code-1", IdTokenSpec::new("sub-1", &nonce));
    app.state
        .federation
        .callback(PROVIDER, "code-1", &request.state, &ClientMeta::default())
        .await
        .unwrap();
    let exchange = app.gateway.last_exchange().unwrap();
    assert_eq!(pkce_challenge(&exchange.code_verifier), challenge);
    assert_eq!(exchange.code_verifier.len(), 43);
    assert_eq!(exchange.redirect_uri, REDIRECT_URI);
}

#[tokio::test]
async fn unknown_provider_is_rejected() {
    let app = test_app();
    let result = app
        .state
        .federation
        .begin_authorization("nope", REDIRECT_URI)
        .await;
    assert!(matches!(result, Err(FederationError::ProviderNotFound(_))));
}

#[tokio::test]
async fn first_login_creates_principal_then_resolves_by_identity() {
    let app = test_app();
    let (state, nonce) = begin(&app).await;
    app.gateway.script(
        "code-1",
        IdTokenSpec::new("sub-42", &nonce)
            .email("octo@example.com", true)
            .name("Octo Cat"),
    );

    let first = app
        .state
        .federation
        .callback(PROVIDER, "code-1", &state, &ClientMeta::default())
        .await
        .unwrap();
    assert!(first.is_new_user);
    assert!(!first.linked_to_existing);
    assert_eq!(first.user.username, "octo");
    assert_eq!(first.user.email.as_deref(), Some("octo@example.com"));
    assert!(first.user.email_verified);
    assert!(!first.user.has_password);

    let (state, nonce) = begin(&app).await;
    let mut spec = IdTokenSpec::new("sub-42", &nonce)
        .email("octo@example.com", true)
        .name("Octo the Cat");
    spec.picture = Some("https://img.example.com/octo.png".to_string());
    app.gateway.script("code-2", spec);

    let second = app
        .state
        .federation
        .callback(PROVIDER, "code-2", &state, &ClientMeta::default())
        .await
        .unwrap();
    assert!(!second.is_new_user);
    assert!(!second.linked_to_existing);
    assert_eq!(second.user.user_id, first.user.user_id);
    assert_eq!(second.user.display_name.as_deref(), Some("Octo the Cat"));

    let stored = app
        .store
        .find_user_by_id(first.user.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.avatar_url.as_deref(),
        Some("https://img.example.com/octo.png")
    );
}

#[tokio::test]
async fn verified_email_links_to_existing_account() {
    let app = test_app();
    let local = app
        .state
        .auth
        .register(
            Registration {
                username: "jane".to_string(),
                email: Some("jane@example.com".to_string()),
                password: Password::new("password-jane".to_string()),
                display_name: None,
            },
            &ClientMeta::default(),
        )
        .await
        .unwrap();

    let (state, nonce) = begin(&app).await;
    app.gateway.script(
        "code",
        IdTokenSpec::new("jane-at-acme", &nonce).email("jane@example.com", true),
    );
    let login = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await
        .unwrap();

    assert!(login.linked_to_existing);
    assert!(!login.is_new_user);
    assert_eq!(login.user.user_id, local.user.user_id);
    // The provider vouched for the address, not the local account.
    assert!(!login.user.email_verified);
    let stored = app
        .store
        .find_user_by_id(local.user.user_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.email_verified);

    let identities = app
        .state
        .federation
        .list_identities(local.user.user_id)
        .await
        .unwrap();
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].provider, PROVIDER);
    assert_eq!(identities[0].issuer, common::ISSUER);
}

/// Identity lookups that miss once on demand, as if another login for the
/// same subject committed right after the read.
struct StaleIdentityReads {
    inner: Arc<MemoryStore>,
    miss_next: AtomicBool,
}

#[async_trait]
impl IdentityStore for StaleIdentityReads {
    async fn find_identity(
        &self,
        issuer: &str,
        subject: &str,
    ) -> Result<Option<FederatedIdentity>, StoreError> {
        if self.miss_next.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_identity(issuer, subject).await
    }

    async fn insert_identity(&self, identity: &FederatedIdentity) -> Result<(), StoreError> {
        self.inner.insert_identity(identity).await
    }

    async fn insert_user_with_identity(
        &self,
        user: &User,
        identity: &FederatedIdentity,
    ) -> Result<(), StoreError> {
        self.inner.insert_user_with_identity(user, identity).await
    }

    async fn update_identity_claims(
        &self,
        identity_id: uuid::Uuid,
        email: Option<String>,
        email_verified: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner
            .update_identity_claims(identity_id, email, email_verified, now)
            .await
    }

    async fn list_identities(
        &self,
        user_id: uuid::Uuid,
    ) -> Result<Vec<FederatedIdentity>, StoreError> {
        self.inner.list_identities(user_id).await
    }

    async fn delete_identity_guarded(
        &self,
        user_id: uuid::Uuid,
        issuer: &str,
    ) -> Result<UnlinkOutcome, StoreError> {
        self.inner.delete_identity_guarded(user_id, issuer).await
    }
}

fn app_with_stale_identity_reads() -> (common::TestApp, Arc<StaleIdentityReads>) {
    let mut lagging = None;
    let app = test_app_with_stores(test_config(), |store| {
        let reads = Arc::new(StaleIdentityReads {
            inner: store.clone(),
            miss_next: AtomicBool::new(false),
        });
        lagging = Some(reads.clone());
        let mut stores = Stores::from_backend(store);
        stores.identities = reads;
        stores
    });
    (app, lagging.unwrap())
}

#[tokio::test]
async fn concurrent_first_login_resolves_to_existing_principal() {
    let (app, reads) = app_with_stale_identity_reads();

    let (state, nonce) = begin(&app).await;
    app.gateway.script("code-1", IdTokenSpec::new("sub-race", &nonce));
    let first = app
        .state
        .federation
        .callback(PROVIDER, "code-1", &state, &ClientMeta::default())
        .await
        .unwrap();
    assert!(first.is_new_user);

    // The second login's lookup misses, so it attempts to create a principal
    // and collides with the identity the first login stored.
    reads.miss_next.store(true, Ordering::SeqCst);
    let (state, nonce) = begin(&app).await;
    app.gateway.script("code-2", IdTokenSpec::new("sub-race", &nonce));
    let second = app
        .state
        .federation
        .callback(PROVIDER, "code-2", &state, &ClientMeta::default())
        .await
        .unwrap();

    assert!(!second.is_new_user);
    assert!(!second.linked_to_existing);
    assert_eq!(second.user.user_id, first.user.user_id);
    assert!(!reads.miss_next.load(Ordering::SeqCst));
    assert_eq!(
        app.state
            .federation
            .list_identities(first.user.user_id)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn concurrent_link_by_email_resolves_to_linked_principal() {
    let (app, reads) = app_with_stale_identity_reads();
    let local = User::new_local(
        "sam".to_string(),
        Some("sam@example.com".to_string()),
        "unused-hash".to_string(),
        None,
    );
    app.store.insert_user(&local).await.unwrap();

    let (state, nonce) = begin(&app).await;
    app.gateway.script(
        "code-1",
        IdTokenSpec::new("sam-at-acme", &nonce).email("sam@example.com", true),
    );
    let first = app
        .state
        .federation
        .callback(PROVIDER, "code-1", &state, &ClientMeta::default())
        .await
        .unwrap();
    assert!(first.linked_to_existing);

    reads.miss_next.store(true, Ordering::SeqCst);
    let (state, nonce) = begin(&app).await;
    app.gateway.script(
        "code-2",
        IdTokenSpec::new("sam-at-acme", &nonce).email("sam@example.com", true),
    );
    let second = app
        .state
        .federation
        .callback(PROVIDER, "code-2", &state, &ClientMeta::default())
        .await
        .unwrap();

    assert!(!second.is_new_user);
    assert_eq!(second.user.user_id, local.user_id);
}

#[tokio::test]
async fn unverified_email_never_links() {
    let app = test_app();
    let local = User::new_local(
        "victim".to_string(),
        Some("victim@example.com".to_string()),
        "unused-hash".to_string(),
        None,
    );
    app.store.insert_user(&local).await.unwrap();

    let (state, nonce) = begin(&app).await;
    app.gateway.script(
        "code",
        IdTokenSpec::new("attacker", &nonce).email("victim@example.com", false),
    );
    let login = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await
        .unwrap();

    assert!(login.is_new_user);
    assert!(!login.linked_to_existing);
    assert_ne!(login.user.user_id, local.user_id);
    // The address already belongs to someone else.
    assert!(login.user.email.is_none());
    assert_ne!(login.user.username, "victim");
    assert!(login.user.username.starts_with("victim"));
}

#[tokio::test]
async fn state_is_single_use() {
    let app = test_app();
    let (state, nonce) = begin(&app).await;
    app.gateway.script("code", IdTokenSpec::new("sub", &nonce));

    app.state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await
        .unwrap();
    let replay = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await;
    assert!(matches!(replay, Err(FederationError::InvalidState)));
}

#[tokio::test]
async fn expired_state_is_rejected_before_exchange() {
    let mut config = test_config();
    config.oidc.pkce_state_ttl_seconds = 1;
    let app = test_app_with(config);
    let (state, nonce) = begin(&app).await;
    app.gateway.script("code", IdTokenSpec::new("sub", &nonce));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let result = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await;
    assert!(matches!(result, Err(FederationError::StateExpired)));
    assert!(app.gateway.last_exchange().is_none());
}

#[tokio::test]
async fn state_from_another_provider_is_invalid() {
    let mut config = test_config();
    let mut other = config.oidc.providers[0].clone();
    other.slug = "other".to_string();
    config.oidc.providers.push(other);
    let app = test_app_with(config);

    let (state, _) = begin(&app).await;
    let result = app
        .state
        .federation
        .callback("other", "code", &state, &ClientMeta::default())
        .await;
    assert!(matches!(result, Err(FederationError::InvalidState)));

    // Consumed by the failed attempt.
    let retry = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await;
    assert!(matches!(retry, Err(FederationError::InvalidState)));
}

#[tokio::test]
async fn nonce_mismatch_is_rejected() {
    let app = test_app();
    let (state, _) = begin(&app).await;
    app.gateway
        .script("code", IdTokenSpec::new("sub", "some-other-nonce"));

    let result = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await;
    assert!(matches!(result, Err(FederationError::NonceMismatch)));
}

#[tokio::test]
async fn wrong_audience_is_an_invalid_id_token() {
    let app = test_app();
    let (state, nonce) = begin(&app).await;
    let mut spec = IdTokenSpec::new("sub", &nonce);
    spec.audience = Some("someone-else".to_string());
    app.gateway.script("code", spec);

    let result = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await;
    assert!(matches!(result, Err(FederationError::InvalidIdToken(_))));
}

#[tokio::test]
async fn unknown_key_id_forces_one_refetch() {
    let app = test_app();
    app.gateway.serve_stale_keys_once();

    let (state, nonce) = begin(&app).await;
    app.gateway.script("code", IdTokenSpec::new("sub", &nonce));
    app.state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await
        .unwrap();
    assert_eq!(app.gateway.jwks_fetches.load(Ordering::SeqCst), 2);

    // Discovery and keys are now cached.
    let (state, nonce) = begin(&app).await;
    app.gateway.script("code-2", IdTokenSpec::new("sub", &nonce));
    app.state
        .federation
        .callback(PROVIDER, "code-2", &state, &ClientMeta::default())
        .await
        .unwrap();
    assert_eq!(app.gateway.jwks_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(app.gateway.metadata_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_provider_times_out() {
    let mut config = test_config();
    config.oidc.http_timeout_seconds = 1;
    let app = test_app_with(config);
    let (state, nonce) = begin(&app).await;
    app.gateway.script("code", IdTokenSpec::new("sub", &nonce));
    app.gateway.set_delay(Duration::from_secs(3));

    let result = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await;
    assert!(matches!(result, Err(FederationError::ProviderTimeout)));
}

#[tokio::test]
async fn cancelled_callback_consumes_state() {
    let app = test_app();
    let (state, nonce) = begin(&app).await;
    app.gateway.script("code", IdTokenSpec::new("sub", &nonce));
    app.gateway.set_delay(Duration::from_millis(500));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = app
        .state
        .federation
        .callback_with_cancel(PROVIDER, "code", &state, &ClientMeta::default(), Some(&cancel))
        .await;
    assert!(matches!(result, Err(FederationError::Cancelled)));
    assert!(app.state.pkce.is_empty());
}

#[tokio::test]
async fn unlink_guards_last_login_method() {
    let app = test_app();
    let (state, nonce) = begin(&app).await;
    app.gateway
        .script("code", IdTokenSpec::new("sub-x", &nonce).email("x@example.com", true));
    let login = app
        .state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await
        .unwrap();

    let result = app.state.federation.unlink(login.user.user_id, PROVIDER).await;
    assert!(matches!(result, Err(FederationError::CannotUnlinkLastLoginMethod)));
    assert_eq!(
        app.store
            .list_identities(login.user.user_id)
            .await
            .unwrap()
            .len(),
        1
    );

    let missing = app
        .state
        .federation
        .unlink(uuid::Uuid::new_v4(), PROVIDER)
        .await;
    assert!(matches!(missing, Err(FederationError::IdentityNotFound)));
}

#[tokio::test]
async fn unlink_succeeds_when_password_remains() {
    let app = test_app();
    let local = app
        .state
        .auth
        .register(
            Registration {
                username: "pat".to_string(),
                email: Some("pat@example.com".to_string()),
                password: Password::new("password-pat".to_string()),
                display_name: None,
            },
            &ClientMeta::default(),
        )
        .await
        .unwrap();

    let (state, nonce) = begin(&app).await;
    app.gateway
        .script("code", IdTokenSpec::new("pat-sub", &nonce).email("pat@example.com", true));
    app.state
        .federation
        .callback(PROVIDER, "code", &state, &ClientMeta::default())
        .await
        .unwrap();

    app.state
        .federation
        .unlink(local.user.user_id, PROVIDER)
        .await
        .unwrap();
    assert!(app
        .state
        .federation
        .list_identities(local.user.user_id)
        .await
        .unwrap()
        .is_empty());
}
