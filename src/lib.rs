//! # Berth
//!
//! Control-plane API for the Berth multi-tenant PaaS. This crate assembles
//! the core services and feature plugins into a running server: the
//! [`core::App`] orchestrator owns the middleware chain, route table, and
//! request dispatch; [`handlers::axum`] binds it onto an HTTP listener.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use berth::core::App;
//! use berth_core::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::builder(AppConfig::new("a-32-byte-minimum-signing-secret!"))
//!         .build()
//!         .await?;
//!     let router = berth::handlers::axum::router(Arc::new(app));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod handlers;

pub use self::core::{App, AppBuilder};
