use std::sync::Arc;

use throttle_limit::Registry;
use tower::Layer;

use crate::service::FinalizeService;

/// Releases the limits of every job that passes through the wrapped service.
#[derive(Clone, Debug)]
pub struct FinalizeLayer {
    registry: Arc<Registry>,
}

impl FinalizeLayer {
    /// Create a FinalizeLayer
    pub fn new(registry: Arc<Registry>) -> Self {
        FinalizeLayer { registry }
    }
}

impl<S> Layer<S> for FinalizeLayer {
    type Service = FinalizeService<S>;

    fn layer(&self, service: S) -> Self::Service {
        FinalizeService::new(service, Arc::clone(&self.registry))
    }
}
