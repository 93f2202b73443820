use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub shutdown: CancellationToken,
}
