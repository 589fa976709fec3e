//! Tenant namespace records.
//!
//! The record store is an external collaborator of the request core;
//! it is consumed through this trait so the in-memory implementation
//! can be swapped for a persistent one without touching the
//! middlewares that query it.

use std::collections::BTreeSet;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;

/// Namespace record store consumed by the namespace policy
/// middlewares for existence checks and auto-provisioning.
pub trait TenantRegistry: Send + Sync {
    /// Whether a record exists for this namespace.
    fn exists<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, bool>;

    /// Create a record for this namespace if absent. Returns true if
    /// a record was newly created.
    fn provision<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, bool>;
}

/// Process-local registry backed by a set.
#[derive(Default)]
pub struct InMemoryTenantRegistry {
    tenants: RwLock<BTreeSet<String>>,
}

impl InMemoryTenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry with known namespaces.
    pub fn with_tenants<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenants: RwLock::new(tenants.into_iter().map(Into::into).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.read().is_empty()
    }
}

impl TenantRegistry for InMemoryTenantRegistry {
    fn exists<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.tenants.read().contains(namespace) })
    }

    fn provision<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.tenants.write().insert(namespace.to_string()) })
    }
}
