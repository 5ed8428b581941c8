//! Middleware giving every registered job a chance to run on each request.

use crate::background_jobs::RequestAttempts;
use crate::server::state::GuardedJobScheduler;
use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use std::sync::Arc;
use tracing::debug;

pub async fn scheduler_hook(
    State(scheduler): State<GuardedJobScheduler>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let attempts = match request.extensions().get::<Arc<RequestAttempts>>() {
        Some(attempts) => attempts.clone(),
        None => {
            let attempts = Arc::new(RequestAttempts::default());
            request.extensions_mut().insert(attempts.clone());
            attempts
        }
    };

    let reports = scheduler.on_request(attempts).await;
    if !reports.is_empty() {
        debug!(
            "{} {}: {} job(s) considered",
            request.method(),
            request.uri().path(),
            reports.len()
        );
    }

    next.run(request).await
}
