pub mod auth;
pub mod billing;
pub mod oauth;
pub mod orgs;
pub mod projects;
pub mod users;

pub use auth::AuthPlugin;
pub use billing::BillingPlugin;
pub use oauth::OAuthPlugin;
pub use orgs::OrgsPlugin;
pub use projects::ProjectsPlugin;
pub use users::UsersPlugin;
