//! Built-in middlewares: API-key authentication with rate limiting,
//! tenant-namespace extraction/validation, and static file serving.

pub mod auth;
pub mod namespace;
pub mod static_files;

pub use auth::ApiKeyAuth;
pub use namespace::{EnsureNamespace, NamespaceExtractor, RequireNamespace};
pub use static_files::StaticDir;
