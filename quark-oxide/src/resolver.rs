//! Hostname resolution with a test intercept layer
//!
//! Resolution happens in two steps: the endpoint is first translated through
//! the process-wide [`intercepts`] table, then looked up via the system
//! resolver. A resolver can also be switched into fake mode, in which case
//! every lookup must be satisfied from the fed map or it fails.
//!
//! The intercept table is test-only plumbing; production code should not
//! depend on it.

use quark_oxide_core::error::{QuarkError, QuarkResult};
use quark_oxide_core::types::{Endpoint, ServiceEndpoint};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Process-wide endpoint intercept table.
pub mod intercepts {
    use super::{Endpoint, HashMap, Mutex, PoisonError};
    use std::sync::OnceLock;

    fn table() -> &'static Mutex<HashMap<Endpoint, Endpoint>> {
        static TABLE: OnceLock<Mutex<HashMap<Endpoint, Endpoint>>> = OnceLock::new();
        TABLE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    /// Redirect resolution of `from` to `to`
    pub fn add(from: Endpoint, to: Endpoint) {
        table()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(from, to);
    }

    /// Remove every intercept
    pub fn clear() {
        table().lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Translate an endpoint through the table; identity if no entry exists
    #[must_use]
    pub fn translate(endpoint: &Endpoint) -> Endpoint {
        table()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| endpoint.clone())
    }
}

/// Maps an [`Endpoint`] to an ordered list of connectable
/// [`ServiceEndpoint`]s.
pub struct HostResolver {
    fake: Mutex<HashMap<Endpoint, Vec<ServiceEndpoint>>>,
}

impl HostResolver {
    /// Create a resolver backed by the system resolver
    #[must_use]
    pub fn new() -> Self {
        Self {
            fake: Mutex::new(HashMap::new()),
        }
    }

    /// Feed a fake resolution result. Once the fake map is non-empty, every
    /// lookup must hit it or fail with `NotFound`.
    pub fn feed_fake(&self, endpoint: Endpoint, results: Vec<ServiceEndpoint>) {
        self.fake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint, results);
    }

    /// Resolve an endpoint, consulting the intercept table first.
    pub async fn resolve(&self, endpoint: &Endpoint) -> QuarkResult<Vec<ServiceEndpoint>> {
        let target = intercepts::translate(endpoint);
        if &target != endpoint {
            debug!(from = %endpoint, to = %target, "endpoint intercepted");
        }

        {
            let fake = self.fake.lock().unwrap_or_else(PoisonError::into_inner);
            if !fake.is_empty() {
                return fake
                    .get(&target)
                    .cloned()
                    .ok_or_else(|| QuarkError::NotFound(target.to_string()));
            }
        }

        let addrs = tokio::net::lookup_host((target.host(), target.port()))
            .await
            .map_err(|e| QuarkError::NotFound(format!("{target}: {e}")))?;

        let out: Vec<ServiceEndpoint> = addrs
            .map(|addr| ServiceEndpoint::new(addr, target.host()))
            .collect();

        if out.is_empty() {
            return Err(QuarkError::NotFound(target.to_string()));
        }
        Ok(out)
    }
}

impl Default for HostResolver {
    fn default() -> Self {
        Self::new()
    }
}
