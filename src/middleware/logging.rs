use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    http::header,
    middleware::Next,
    Error,
};
use std::time::Instant;
use tracing::{error, info, warn};

fn is_websocket_upgrade(req: &ServiceRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Logs the start and outcome of every request.
///
/// WebSocket upgrades are flagged: their completion is the 101 response, the
/// relay session itself logs separately when it ends.
pub async fn request_logging(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start_time = Instant::now();
    let method = req.method().to_string();
    let path = req.path().to_string();
    let upgrade = is_websocket_upgrade(&req);
    let remote_addr = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();

    info!(method = %method, path = %path, remote_addr = %remote_addr, upgrade, "Request started");

    let result = next.call(req).await;
    let duration_ms = start_time.elapsed().as_millis();

    match &result {
        Ok(response) if response.status().is_client_error() || response.status().is_server_error() => {
            warn!(
                method = %method,
                path = %path,
                remote_addr = %remote_addr,
                status = response.status().as_u16(),
                duration_ms = %duration_ms,
                "Request rejected"
            );
        }
        Ok(response) => {
            info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                duration_ms = %duration_ms,
                upgrade,
                "Request completed"
            );
        }
        Err(err) => {
            error!(
                method = %method,
                path = %path,
                remote_addr = %remote_addr,
                duration_ms = %duration_ms,
                error = %err,
                "Request failed"
            );
        }
    }

    result
}
