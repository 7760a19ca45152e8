use crate::state::AppState;
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error,
};
use std::time::Instant;

/// Counts requests and errors per endpoint in [`AppState`].
///
/// Endpoints are keyed by the matched route pattern, so query strings and
/// path parameters do not each get their own entry.
pub async fn collect_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start_time = Instant::now();
    let route = req.match_pattern().unwrap_or_else(|| "<unmatched>".to_string());
    let endpoint = format!("{} {}", req.method(), route);

    let app_state = req.app_data::<web::Data<AppState>>().cloned();
    if let Some(app_state) = &app_state {
        app_state.increment_request_count();
    }

    let result = next.call(req).await;

    if let Some(app_state) = app_state {
        let is_error = match &result {
            Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
            Err(_) => true,
        };
        app_state.record_endpoint_request(&endpoint, start_time.elapsed().as_millis() as u64, is_error);
        if is_error {
            app_state.increment_error_count();
        }
    }

    result
}
