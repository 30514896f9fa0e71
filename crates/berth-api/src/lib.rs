//! # Berth API
//!
//! Feature plugins for the Berth control-plane: credential auth, user
//! profiles, organizations and invitations, projects and deployments,
//! billing, OAuth federation, the auth provider implementations, and the
//! subscription feature gate.

pub mod email;
pub mod featuregate;
pub mod plugins;
pub mod provider;
pub mod signature;

pub use featuregate::{GateService, PlanLimits, seed_default_plans};
pub use plugins::{
    AuthPlugin, BillingPlugin, OAuthPlugin, OrgsPlugin, ProjectsPlugin, UsersPlugin,
};
pub use provider::{ExternalIdpProvider, IdpWebhookPlugin, LocalProvider};
