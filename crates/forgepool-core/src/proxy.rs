//! `Proxy`: a dynamically populated dispatcher keyed by method name.
//! Statically typed targets have no ergonomic way to expose
//! `pool.proxy().add(1, 2)`-style property access, so this is
//! deliberately the string-keyed rendering of that shape outside
//! dynamic languages.

use crate::error::PoolError;
use crate::handle::TaskHandle;
use crate::pool::{ExecOptions, Pool};
use crate::value::Value;

/// Returned by [`Pool::proxy`]. Holds the remote method list fetched
/// once via the reserved `methods` call so [`Proxy::call`] can reject an
/// unknown name before ever reaching a worker.
pub struct Proxy {
    pool: Pool,
    methods: Vec<String>,
}

impl Proxy {
    pub(crate) async fn discover(pool: Pool) -> Result<Self, PoolError> {
        let handle = pool.exec("methods", Vec::new(), ExecOptions::default()).await?;
        let result = handle.await?;
        let methods = result
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        Ok(Proxy { pool, methods })
    }

    /// The remote names discovered at construction time.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Delegates to `exec(method, args)` after checking the method was
    /// present in the discovered list.
    pub async fn call(&self, method: impl Into<String>, args: Vec<Value>) -> Result<TaskHandle, PoolError> {
        let method = method.into();
        if !self.methods.iter().any(|m| m == &method) {
            return Err(PoolError::MethodNotFound { method });
        }
        self.pool.exec(method, args, ExecOptions::default()).await
    }
}

impl Pool {
    /// Fetches the remote method list once and returns a [`Proxy`]
    /// scoped to it.
    pub async fn proxy(&self) -> Result<Proxy, PoolError> {
        Proxy::discover(self.clone()).await
    }
}
