use std::sync::Arc;

use sqlx::SqlitePool;

use crate::auth::{IdentityReconciler, ProviderRegistry, SsoLoginService};

#[derive(Clone)]
pub struct AppState {
    providers: Arc<ProviderRegistry>,
    login: Arc<SsoLoginService>,
}

impl AppState {
    pub fn new(pool: SqlitePool, providers: ProviderRegistry) -> Self {
        let providers = Arc::new(providers);
        let login = SsoLoginService::new(Arc::clone(&providers), IdentityReconciler::new(pool));

        Self {
            providers,
            login: Arc::new(login),
        }
    }

    pub fn providers(&self) -> Arc<ProviderRegistry> {
        Arc::clone(&self.providers)
    }

    pub fn login(&self) -> Arc<SsoLoginService> {
        Arc::clone(&self.login)
    }
}
