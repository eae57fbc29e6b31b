//! Opening stores by locator.

use std::sync::Arc;

use jobvault_core::url::UrlAccess;
use jobvault_core::{JobStore, Locator, RetryPolicy, StoreError, StoreResult, UrlRegistry};
use jobvault_file::FileJobStore;
use jobvault_object::{
    MEMORY_SCHEME, MemoryBackend, MemoryObjectService, ObjectBackend, ObjectJobStore,
    ObjectUrlAccess,
};

/// Region under which `mem://` URLs are served to stores of other backends.
const MEMORY_URL_REGION: &str = "local";

/// Shared settings for every store opened through [`open`].
#[derive(Clone)]
pub struct OpenContext {
    memory: Arc<MemoryObjectService>,
    retry: RetryPolicy,
    url_handlers: Vec<Arc<dyn UrlAccess>>,
}

impl Default for OpenContext {
    fn default() -> Self {
        Self {
            memory: MemoryObjectService::global(),
            retry: RetryPolicy::default(),
            url_handlers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for OpenContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenContext")
            .field("retry", &self.retry)
            .field("url_handlers", &self.url_handlers.len())
            .finish()
    }
}

impl OpenContext {
    /// Serve `mem:` locators and `mem://` URLs from `service` instead of the
    /// process-wide one.
    pub fn with_memory_service(mut self, service: Arc<MemoryObjectService>) -> Self {
        self.memory = service;
        self
    }

    /// Retry schedule for transient errors of object backends.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Make an extra URL scheme available for import and export.
    pub fn with_url_handler(mut self, handler: Arc<dyn UrlAccess>) -> Self {
        self.url_handlers.push(handler);
        self
    }

    /// Registry for a store whose own objects are served by `native`.
    ///
    /// Later handlers win, so the store's native handler takes precedence
    /// over the caller's, which take precedence over the built-in ones.
    fn url_registry(&self, native: Option<Arc<dyn UrlAccess>>) -> Arc<UrlRegistry> {
        let memory = Arc::new(MemoryBackend::new(self.memory.clone(), MEMORY_URL_REGION));
        let mut urls =
            UrlRegistry::default().with_handler(Arc::new(ObjectUrlAccess::new(memory, self.retry)));
        for handler in &self.url_handlers {
            urls = urls.with_handler(handler.clone());
        }
        if let Some(native) = native {
            urls = urls.with_handler(native);
        }
        Arc::new(urls)
    }

    fn object_store<B: ObjectBackend>(
        &self,
        backend: B,
        name: &str,
    ) -> StoreResult<Box<dyn JobStore>> {
        let backend = Arc::new(backend);
        let store = ObjectJobStore::with_retry_policy(backend.clone(), name, self.retry)?;
        let native = Arc::new(ObjectUrlAccess::new(backend, self.retry));
        Ok(Box::new(store.with_url_registry(self.url_registry(Some(native)))))
    }
}

/// Open a detached handle for the store named by `locator`.
///
/// Nothing is created or read yet; follow up with
/// [`initialize`](JobStore::initialize) or [`resume`](JobStore::resume).
/// Unknown backend prefixes fail with `InvalidLocator`, malformed object
/// store names with `InvalidName`.
pub async fn open(locator: &str, ctx: &OpenContext) -> StoreResult<Box<dyn JobStore>> {
    let parsed = Locator::parse(locator)?;
    tracing::debug!(locator = %parsed, "Opening job store");

    match parsed {
        Locator::File(root) => {
            let store = FileJobStore::new(root)?.with_url_registry(ctx.url_registry(None));
            Ok(Box::new(store))
        }
        Locator::Object {
            backend,
            region,
            name,
        } => match backend.as_str() {
            MEMORY_SCHEME => {
                ctx.object_store(MemoryBackend::new(ctx.memory.clone(), region), &name)
            }
            #[cfg(feature = "s3")]
            jobvault_adapter_s3::S3_PREFIX => {
                let backend = jobvault_adapter_s3::S3Backend::connect(region).await;
                ctx.object_store(backend, &name)
            }
            #[cfg(not(feature = "s3"))]
            "aws" => Err(StoreError::InvalidLocator(format!(
                "{locator}: S3 support not available. Rebuild with --features s3"
            ))),
            other => Err(StoreError::InvalidLocator(format!(
                "{locator}: unknown backend {other:?}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_backend() {
        match open("gcs:us-central1:run", &OpenContext::default()).await.err() {
            Some(StoreError::InvalidLocator(msg)) => assert!(msg.contains("gcs")),
            other => panic!("expected InvalidLocator, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_object_store_name() {
        assert!(matches!(
            open("mem:local:Not_Valid", &OpenContext::default()).await,
            Err(StoreError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_locator() {
        assert!(matches!(
            open("mem:local", &OpenContext::default()).await,
            Err(StoreError::InvalidLocator(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_locator_round_trips() {
        let ctx = OpenContext::default().with_memory_service(MemoryObjectService::new());
        let store = open("mem:eu-central-1:ctx-test", &ctx).await.unwrap();
        assert_eq!(store.locator(), "mem:eu-central-1:ctx-test");
        assert!(matches!(store.config(), Err(StoreError::NotAttached(_))));
    }

    #[test]
    fn test_registry_knows_memory_urls() {
        let ctx = OpenContext::default();
        let urls = ctx.url_registry(None);
        let url = jobvault_core::url::parse_url("mem://some--files/blob/x").unwrap();
        assert!(urls.handler(&url).is_ok());
    }
}
