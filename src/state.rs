use std::sync::Arc;

use axum::extract::FromRef;
use tracing::warn;

use crate::auth::{
    jwt::JwtKeys, password::PasswordHasher, repo::UserRepo, repo_memory::MemoryUserRepo,
    repo_pg::PgUserRepo, services::CredentialService,
};
use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<CredentialService>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let repo: Arc<dyn UserRepo> = match &config.database_url {
            Some(url) => {
                let repo = PgUserRepo::connect(
                    url,
                    config.db_max_connections,
                    config.store_timeout(),
                )
                .await?;
                // unique constraints guard concurrent sign-ups; refuse to start without them
                repo.migrate().await?;
                Arc::new(repo)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory user store");
                Arc::new(MemoryUserRepo::new())
            }
        };

        Self::from_parts(config, repo)
    }

    pub fn from_parts(config: Arc<AppConfig>, repo: Arc<dyn UserRepo>) -> anyhow::Result<Self> {
        let service = CredentialService::new(
            repo,
            PasswordHasher::new(config.password)?,
            JwtKeys::from(&config.jwt),
            config.store_timeout(),
        )?;
        Ok(Self {
            config,
            service: Arc::new(service),
        })
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        let config = Arc::new(AppConfig::for_tests());
        Self::from_parts(config, Arc::new(MemoryUserRepo::new())).expect("fake state")
    }
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        state.service.keys().clone()
    }
}
