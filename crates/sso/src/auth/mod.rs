mod assertion;
mod login;
pub(crate) mod provider;
mod reconcile;

pub use assertion::{AssertionError, ExternalIdentityAssertion};
pub use login::{SsoLoginError, SsoLoginService};
pub use provider::{
    GitHubProvider, GitLabProvider, GoogleProvider, IdentityProvider, ProviderProfile,
    ProviderRegistry,
};
pub use reconcile::{IdentityReconciler, ReconcileError};
