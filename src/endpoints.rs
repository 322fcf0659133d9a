//! Endpoint server for exposing metrics and breaker health

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::metrics::metrics;

/// Start the endpoint server on `port` until `shutdown` fires
pub async fn endpoint_server(
    port: u16,
    breaker: Arc<CircuitBreaker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Metrics endpoint listening on {}", addr);
    serve(listener, breaker, shutdown).await
}

/// Accept loop over an already bound listener
pub async fn serve(
    listener: TcpListener,
    breaker: Arc<CircuitBreaker>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((mut socket, _)) => {
                let breaker = Arc::clone(&breaker);
                tokio::spawn(async move {
                    let mut buf = [0; 1024];
                    match socket.read(&mut buf).await {
                        Ok(n) => {
                            let request = String::from_utf8_lossy(&buf[..n]);
                            let path = request
                                .lines()
                                .next()
                                .and_then(|line| line.split_whitespace().nth(1))
                                .unwrap_or("/");
                            let (status, content_type, body) = respond(path, &breaker);
                            let response = format!(
                                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                                body.len()
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                        }
                        Err(e) => {
                            tracing::error!("Failed to read from socket: {}", e);
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }
}

fn respond(path: &str, breaker: &CircuitBreaker) -> (&'static str, &'static str, String) {
    match path {
        "/metrics" => ("200 OK", "text/plain; version=0.0.4", metrics().render()),
        "/health" => {
            let health = breaker.health();
            let status = if health.state == BreakerState::Open {
                "503 Service Unavailable"
            } else {
                "200 OK"
            };
            let body = serde_json::to_string(&health).unwrap_or_else(|_| "{}".to_string());
            (status, "application/json", body)
        }
        _ => ("404 Not Found", "text/plain", "not found".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use tokio::net::TcpStream;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_reflects_breaker_state() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::clone(&breaker), shutdown.clone()));

        let healthy = get(addr, "/health").await;
        assert!(healthy.starts_with("HTTP/1.1 200"));
        assert!(healthy.contains("\"state\":\"closed\""));

        breaker.record_failure();
        let tripped = get(addr, "/health").await;
        assert!(tripped.starts_with("HTTP/1.1 503"));
        assert!(tripped.contains("\"state\":\"open\""));

        let metrics_page = get(addr, "/metrics").await;
        assert!(metrics_page.starts_with("HTTP/1.1 200"));
        assert!(metrics_page.contains("breaker_trips"));

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
