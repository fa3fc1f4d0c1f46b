use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::dto::Session;
use crate::auth::jwt::JwtKeys;
use crate::auth::password::PasswordHasher;
use crate::auth::repo::{RepoResult, UserRepo};
use crate::auth::repo_types::{NewUser, User, UserFilter, ROLE_USER};
use crate::auth::validation::{
    normalize_email, normalize_username, validate_email, validate_password, validate_username,
};
use crate::errors::{AuthError, IdentityField};

const MAX_PAGE_SIZE: i64 = 100;

/// Registers accounts and exchanges credentials for session tokens.
///
/// Holds no mutable state of its own; every call goes to the record store,
/// each store call bounded by `store_timeout`. Hashing runs on the blocking
/// pool.
pub struct CredentialService {
    repo: Arc<dyn UserRepo>,
    hasher: PasswordHasher,
    keys: JwtKeys,
    store_timeout: Duration,
    // verified against when the identity is unknown, so both failure paths cost the same
    dummy_hash: String,
}

impl CredentialService {
    pub fn new(
        repo: Arc<dyn UserRepo>,
        hasher: PasswordHasher,
        keys: JwtKeys,
        store_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let dummy_hash = hasher.hash(&Uuid::new_v4().to_string())?;
        Ok(Self {
            repo,
            hasher,
            keys,
            store_timeout,
            dummy_hash,
        })
    }

    pub fn keys(&self) -> &JwtKeys {
        &self.keys
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = RepoResult<T>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(res) => res.map_err(AuthError::from),
            Err(_) => {
                let timeout_ms = self.store_timeout.as_millis() as u64;
                warn!(op, timeout_ms, "store call timed out");
                Err(AuthError::StoreUnavailable(format!("{op} timed out")))
            }
        }
    }

    async fn hash_off_thread(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("hash task failed: {e}")))?
            .map_err(AuthError::Internal)
    }

    async fn verify_off_thread(&self, password: &str, hash: &str) -> anyhow::Result<bool> {
        let hasher = self.hasher.clone();
        let password = password.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash)).await?
    }

    /// Create an account with the default role set.
    #[instrument(skip(self, email, password))]
    pub async fn register_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        let username = normalize_username(username);
        let email = normalize_email(email);
        validate_username(&username)?;
        validate_email(&email)?;
        validate_password(password)?;

        if self
            .bounded("find_by_username", self.repo.find_by_username(&username))
            .await?
            .is_some()
        {
            debug!(%username, "username already taken");
            return Err(AuthError::DuplicateIdentity {
                field: IdentityField::Username,
            });
        }
        if self
            .bounded("find_by_email", self.repo.find_by_email(&email))
            .await?
            .is_some()
        {
            debug!(%username, "email already taken");
            return Err(AuthError::DuplicateIdentity {
                field: IdentityField::Email,
            });
        }

        let password_hash = self.hash_off_thread(password).await?;

        let new_user = NewUser {
            id: Uuid::new_v4(),
            username,
            email,
            password_hash,
            roles: BTreeSet::from([ROLE_USER.to_string()]),
            created_at: OffsetDateTime::now_utc(),
        };
        // the store re-checks both keys at commit; a lost race lands here as a conflict
        let user = self
            .bounded("insert_unique", self.repo.insert_unique(new_user))
            .await?;

        info!(user_id = %user.id, username = %user.username, "user registered");
        Ok(user)
    }

    /// Verify credentials; the identifier may be a username or an email.
    #[instrument(skip_all)]
    pub async fn authenticate_user(
        &self,
        username_or_email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let identifier = username_or_email.trim();
        if identifier.is_empty() || password.is_empty() {
            return Err(AuthError::ValidationFailed(
                "username or email and password are required".into(),
            ));
        }

        // Both lookups always run, so a known and an unknown identity cost the
        // same store round-trips; a username match wins over an email match.
        let email = normalize_email(identifier);
        let (by_username, by_email) = tokio::join!(
            self.bounded("find_by_username", self.repo.find_by_username(identifier)),
            self.bounded("find_by_email", self.repo.find_by_email(&email)),
        );
        let found = by_username?.or(by_email?);

        let Some(user) = found else {
            // burn the same work as a real check before rejecting
            let _ = self.verify_off_thread(password, &self.dummy_hash).await;
            debug!("sign-in rejected: unknown identity");
            return Err(AuthError::InvalidCredentials);
        };

        match self.verify_off_thread(password, &user.password_hash).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(user_id = %user.id, "sign-in rejected: invalid password");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => {
                error!(user_id = %user.id, error = %e, "stored password hash unreadable");
                return Err(AuthError::InvalidCredentials);
            }
        }

        if !user.is_active {
            warn!(user_id = %user.id, "sign-in rejected: account inactive");
            return Err(AuthError::InvalidCredentials);
        }

        let session = self.issue_session(user)?;
        info!(user_id = %session.user.id, "session issued");
        Ok(session)
    }

    /// Exchange a refresh token for a new token pair.
    #[instrument(skip_all)]
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let claims = self.keys.verify_refresh(refresh_token).map_err(|e| {
            debug!(error = %e, "refresh token rejected");
            AuthError::InvalidToken
        })?;

        let user = self
            .bounded("find_by_id", self.repo.find_by_id(claims.sub))
            .await?
            .ok_or_else(|| {
                warn!(user_id = %claims.sub, "refresh for unknown user");
                AuthError::InvalidToken
            })?;
        if !user.is_active {
            warn!(user_id = %user.id, "refresh rejected: account inactive");
            return Err(AuthError::InvalidToken);
        }

        let session = self.issue_session(user)?;
        info!(user_id = %session.user.id, "session refreshed");
        Ok(session)
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        self.bounded("find_by_id", self.repo.find_by_id(user_id))
            .await?
            .ok_or(AuthError::NotFound)
    }

    /// Replace the password after re-checking the current one.
    #[instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<User, AuthError> {
        validate_password(new_password)?;
        let user = self.current_user(user_id).await?;

        match self
            .verify_off_thread(current_password, &user.password_hash)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(user_id = %user.id, "password change rejected: wrong current password");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => {
                error!(user_id = %user.id, error = %e, "stored password hash unreadable");
                return Err(AuthError::InvalidCredentials);
            }
        }

        let password_hash = self.hash_off_thread(new_password).await?;
        let user = self
            .bounded(
                "update_password",
                self.repo
                    .update_password(user_id, &password_hash, OffsetDateTime::now_utc()),
            )
            .await?
            .ok_or(AuthError::NotFound)?;

        info!(user_id = %user.id, "password changed");
        Ok(user)
    }

    /// Staff directory listing; `limit` is clamped to 1..=100.
    pub async fn list_users(&self, mut filter: UserFilter) -> Result<Vec<User>, AuthError> {
        filter.limit = filter.limit.clamp(1, MAX_PAGE_SIZE);
        filter.offset = filter.offset.max(0);
        filter.search = filter
            .search
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.bounded("list", self.repo.list(&filter)).await
    }

    #[instrument(skip(self))]
    pub async fn set_active(&self, user_id: Uuid, active: bool) -> Result<User, AuthError> {
        let user = self
            .bounded(
                "set_active",
                self.repo
                    .set_active(user_id, active, OffsetDateTime::now_utc()),
            )
            .await?
            .ok_or(AuthError::NotFound)?;
        info!(user_id = %user.id, active, "account activity changed");
        Ok(user)
    }

    fn issue_session(&self, user: User) -> Result<Session, AuthError> {
        let access_token = self.keys.sign_access(&user)?;
        let refresh_token = self.keys.sign_refresh(&user)?;
        Ok(Session {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.keys.access_ttl.as_secs(),
            user: user.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::auth::claims::TokenKind;
    use crate::auth::repo::RepoError;
    use crate::auth::repo_memory::MemoryUserRepo;
    use crate::config::AppConfig;

    fn service_with(repo: Arc<dyn UserRepo>, timeout: Duration) -> CredentialService {
        let cfg = AppConfig::for_tests();
        CredentialService::new(
            repo,
            PasswordHasher::new(cfg.password).unwrap(),
            JwtKeys::from(&cfg.jwt),
            timeout,
        )
        .expect("service")
    }

    fn service() -> (CredentialService, Arc<MemoryUserRepo>) {
        let repo = Arc::new(MemoryUserRepo::new());
        (service_with(repo.clone(), Duration::from_secs(1)), repo)
    }

    #[tokio::test]
    async fn register_stores_hash_and_default_role() {
        let (svc, repo) = service();
        let user = svc
            .register_user("alice", "Alice@X.com", "Secret1")
            .await
            .expect("register");

        assert_eq!(user.email, "alice@x.com");
        assert_eq!(user.roles, BTreeSet::from([ROLE_USER.to_string()]));
        assert_eq!(user.created_at, user.updated_at);

        let stored = repo.find_by_username("alice").await.unwrap().unwrap();
        assert_ne!(stored.password_hash, "Secret1");
        assert!(!stored.password_hash.contains("Secret1"));
    }

    #[tokio::test]
    async fn duplicate_username_and_email_are_named() {
        let (svc, repo) = service();
        svc.register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();

        let err = svc
            .register_user("alice", "other@x.com", "Secret1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::DuplicateIdentity {
                field: IdentityField::Username
            }
        ));

        let err = svc
            .register_user("bob", "ALICE@x.com", "Secret1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::DuplicateIdentity {
                field: IdentityField::Email
            }
        ));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_admit_one() {
        let (svc, repo) = service();
        let (a, b) = tokio::join!(
            svc.register_user("bob", "bob1@x.com", "Secret1"),
            svc.register_user("bob", "bob2@x.com", "Secret1"),
        );
        let outcomes = [a, b];
        let ok = outcomes.iter().filter(|r| r.is_ok()).count();
        let dup = outcomes
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(AuthError::DuplicateIdentity {
                        field: IdentityField::Username
                    })
                )
            })
            .count();
        assert_eq!((ok, dup), (1, 1));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn register_rejects_malformed_input() {
        let (svc, repo) = service();
        for (u, e, p) in [
            ("   ", "a@x.com", "Secret1"),
            ("alice", "not-an-email", "Secret1"),
            ("alice", "a@x.com", "123"),
        ] {
            let err = svc.register_user(u, e, p).await.unwrap_err();
            assert!(matches!(err, AuthError::ValidationFailed(_)), "{u} {e}");
        }
        assert_eq!(repo.len().await, 0);
    }

    #[tokio::test]
    async fn sign_in_by_username_or_email() {
        let (svc, _) = service();
        let user = svc
            .register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();

        let by_name = svc.authenticate_user("alice", "Secret1").await.unwrap();
        let claims = svc.keys().verify_access(&by_name.access_token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert!(claims.has_role(ROLE_USER));
        assert_eq!(by_name.token_type, "Bearer");
        assert_eq!(by_name.expires_in, 5 * 60);

        let by_email = svc
            .authenticate_user(" Alice@X.com ", "Secret1")
            .await
            .unwrap();
        assert_eq!(by_email.user.id, user.id);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let (svc, _) = service();
        svc.register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();

        let wrong = svc.authenticate_user("alice", "WrongPass").await.unwrap_err();
        let unknown = svc.authenticate_user("mallory", "Secret1").await.unwrap_err();
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert_eq!(wrong.status_code(), unknown.status_code());
    }

    #[tokio::test]
    async fn corrupt_stored_hash_is_invalid_credentials() {
        let repo = Arc::new(MemoryUserRepo::new());
        repo.insert_unique(NewUser {
            id: Uuid::new_v4(),
            username: "carol".into(),
            email: "carol@x.com".into(),
            password_hash: "plaintext-by-mistake".into(),
            roles: BTreeSet::from([ROLE_USER.to_string()]),
            created_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
        let svc = service_with(repo, Duration::from_secs(1));
        let err = svc
            .authenticate_user("carol", "plaintext-by-mistake")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn refresh_issues_new_pair() {
        let (svc, _) = service();
        svc.register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();
        let session = svc.authenticate_user("alice", "Secret1").await.unwrap();

        let refreshed = svc.refresh_session(&session.refresh_token).await.unwrap();
        let claims = svc.keys().verify(&refreshed.refresh_token).unwrap();
        assert_eq!(claims.kind, TokenKind::Refresh);
        assert_eq!(claims.sub, session.user.id);

        let err = svc
            .refresh_session(&session.access_token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn current_user_missing_is_not_found() {
        let (svc, _) = service();
        let err = svc.current_user(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
    }

    struct StalledRepo;

    #[async_trait]
    impl UserRepo for StalledRepo {
        async fn find_by_id(&self, _id: Uuid) -> RepoResult<Option<User>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn find_by_username(&self, _u: &str) -> RepoResult<Option<User>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn find_by_email(&self, _e: &str) -> RepoResult<Option<User>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn insert_unique(&self, _user: NewUser) -> RepoResult<User> {
            Err(RepoError::Unavailable("stalled".into()))
        }
        async fn list(&self, _filter: &UserFilter) -> RepoResult<Vec<User>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
        async fn update_password(
            &self,
            _id: Uuid,
            _hash: &str,
            _at: OffsetDateTime,
        ) -> RepoResult<Option<User>> {
            Err(RepoError::Unavailable("stalled".into()))
        }
        async fn set_active(
            &self,
            _id: Uuid,
            _active: bool,
            _at: OffsetDateTime,
        ) -> RepoResult<Option<User>> {
            Err(RepoError::Unavailable("stalled".into()))
        }
    }

    #[tokio::test]
    async fn stalled_store_surfaces_unavailable() {
        let svc = service_with(Arc::new(StalledRepo), Duration::from_millis(50));
        let started = std::time::Instant::now();
        let err = svc.authenticate_user("alice", "Secret1").await.unwrap_err();
        assert!(matches!(err, AuthError::StoreUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(2));

        let err = svc
            .register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::StoreUnavailable(_)));
    }

    /// Counts identity lookups on top of the in-memory store.
    #[derive(Default)]
    struct CountingRepo {
        inner: MemoryUserRepo,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl UserRepo for CountingRepo {
        async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
            self.inner.find_by_id(id).await
        }
        async fn find_by_username(&self, username: &str) -> RepoResult<Option<User>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_username(username).await
        }
        async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_email(email).await
        }
        async fn insert_unique(&self, user: NewUser) -> RepoResult<User> {
            self.inner.insert_unique(user).await
        }
        async fn list(&self, filter: &UserFilter) -> RepoResult<Vec<User>> {
            self.inner.list(filter).await
        }
        async fn update_password(
            &self,
            id: Uuid,
            hash: &str,
            at: OffsetDateTime,
        ) -> RepoResult<Option<User>> {
            self.inner.update_password(id, hash, at).await
        }
        async fn set_active(
            &self,
            id: Uuid,
            active: bool,
            at: OffsetDateTime,
        ) -> RepoResult<Option<User>> {
            self.inner.set_active(id, active, at).await
        }
    }

    #[tokio::test]
    async fn unknown_identity_costs_the_same_lookups_as_wrong_password() {
        let repo = Arc::new(CountingRepo::default());
        let svc = service_with(repo.clone(), Duration::from_secs(1));
        svc.register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();

        repo.lookups.store(0, Ordering::SeqCst);
        svc.authenticate_user("alice", "WrongPass").await.unwrap_err();
        let known = repo.lookups.swap(0, Ordering::SeqCst);

        svc.authenticate_user("mallory", "WrongPass").await.unwrap_err();
        let unknown = repo.lookups.swap(0, Ordering::SeqCst);

        svc.authenticate_user("alice@x.com", "WrongPass")
            .await
            .unwrap_err();
        let by_email = repo.lookups.load(Ordering::SeqCst);

        assert_eq!(known, 2);
        assert_eq!(unknown, known);
        assert_eq!(by_email, known);
    }

    #[tokio::test]
    async fn inactive_account_cannot_sign_in_or_refresh() {
        let (svc, _) = service();
        let user = svc
            .register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();
        let session = svc.authenticate_user("alice", "Secret1").await.unwrap();

        let deactivated = svc.set_active(user.id, false).await.unwrap();
        assert!(!deactivated.is_active);
        assert!(deactivated.updated_at > user.updated_at);

        let err = svc.authenticate_user("alice", "Secret1").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        let err = svc
            .refresh_session(&session.refresh_token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));

        svc.set_active(user.id, true).await.unwrap();
        assert!(svc.authenticate_user("alice", "Secret1").await.is_ok());
    }

    #[tokio::test]
    async fn set_active_unknown_user_is_not_found() {
        let (svc, _) = service();
        let err = svc.set_active(Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, AuthError::NotFound));
    }

    #[tokio::test]
    async fn change_password_bumps_updated_at_and_retires_old_secret() {
        let (svc, _) = service();
        let user = svc
            .register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();

        let changed = svc
            .change_password(user.id, "Secret1", "Fresh22")
            .await
            .expect("change password");
        assert!(changed.updated_at > user.updated_at);
        assert_eq!(changed.created_at, user.created_at);
        assert_ne!(changed.password_hash, user.password_hash);

        let err = svc.authenticate_user("alice", "Secret1").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert!(svc.authenticate_user("alice", "Fresh22").await.is_ok());
    }

    #[tokio::test]
    async fn change_password_checks_current_and_new() {
        let (svc, _) = service();
        let user = svc
            .register_user("alice", "alice@x.com", "Secret1")
            .await
            .unwrap();

        let err = svc
            .change_password(user.id, "WrongPass", "Fresh22")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        let err = svc
            .change_password(user.id, "Secret1", "123")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(_)));

        let err = svc
            .change_password(Uuid::new_v4(), "Secret1", "Fresh22")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound));

        assert!(svc.authenticate_user("alice", "Secret1").await.is_ok());
    }

    #[tokio::test]
    async fn list_users_searches_and_clamps_paging() {
        let (svc, _) = service();
        for (u, e) in [
            ("alice", "alice@x.com"),
            ("bob", "bob@school.edu"),
            ("carol", "carol@school.edu"),
        ] {
            svc.register_user(u, e, "Secret1").await.unwrap();
        }

        let school = svc
            .list_users(UserFilter {
                search: Some("  SCHOOL ".into()),
                limit: 20,
                offset: 0,
            })
            .await
            .unwrap();
        let mut names: Vec<_> = school.iter().map(|u| u.username.as_str()).collect();
        names.sort();
        assert_eq!(names, ["bob", "carol"]);

        let blank_search = svc
            .list_users(UserFilter {
                search: Some("   ".into()),
                limit: 0,
                offset: -3,
            })
            .await
            .unwrap();
        assert_eq!(blank_search.len(), 1);

        let all = svc
            .list_users(UserFilter {
                search: None,
                limit: 10_000,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }
}
