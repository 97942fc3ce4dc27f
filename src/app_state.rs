//! Shared state handed to every axum handler via `State<AppState>`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;
use crate::tracing::LogChannel;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub cancellation_token: CancellationToken,
    pub log_channel: LogChannel,
}
