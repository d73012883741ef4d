use httpmock::prelude::*;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

use nox_client::{BackoffStrategy, NoxEnvironment, NoxError, NoxRestClient, RetryConfig};

fn fast_retries(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        strategy: BackoffStrategy::Exponential,
    }
}

fn client_with_retries(server: &MockServer, config: RetryConfig) -> NoxRestClient {
    NoxRestClient::builder(NoxEnvironment::new(&server.base_url()).unwrap())
        .with_retry_config(config)
        .build()
        .unwrap()
}

#[tokio::test]
async fn server_errors_exhaust_the_retry_budget() {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/health");
        then.status(500).json_body(json!({"message": "db down"}));
    });

    let client = client_with_retries(&server, fast_retries(3));
    let err = client.get_health_status().await.unwrap_err();
    match err {
        NoxError::Api {
            status, message, ..
        } => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(message, "db down");
        }
        other => panic!("expected api error, got {other:?}"),
    }

    // Initial attempt plus three retries.
    mock.assert_hits(4);
}

#[tokio::test]
async fn persistent_429_surfaces_as_rate_limited() {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/health");
        then.status(429)
            .header("retry-after", "0")
            .header("x-request-id", "rl-1")
            .json_body(json!({"message": "slow down"}));
    });

    let client = client_with_retries(&server, fast_retries(2));
    let err = client.get_health_status().await.unwrap_err();
    match err {
        NoxError::RateLimited {
            retry_after,
            request_id,
        } => {
            assert_eq!(retry_after, Some(Duration::ZERO));
            assert_eq!(request_id.as_deref(), Some("rl-1"));
        }
        other => panic!("expected rate limited error, got {other:?}"),
    }

    mock.assert_hits(3);
}

#[tokio::test]
async fn retry_after_header_overrides_backoff() {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/health");
        then.status(429)
            .header("retry-after", "1")
            .json_body(json!({"message": "slow down"}));
    });

    let client = client_with_retries(&server, fast_retries(1));
    let started = Instant::now();
    let err = client.get_health_status().await.unwrap_err();
    assert!(matches!(err, NoxError::RateLimited { .. }));

    // Backoff alone would wait ~10ms; the header forces a full second.
    assert!(started.elapsed() >= Duration::from_secs(1));
    mock.assert_hits(2);
}

/// Minimal HTTP server that fails a fixed number of times before succeeding,
/// recording the `x-request-id` of every attempt. httpmock cannot sequence
/// responses, so this one is hand-rolled.
async fn flaky_server(
    failures_before_success: usize,
) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let request_ids: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let seen = request_ids.clone();
    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };

            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => raw.extend_from_slice(&buf[..n]),
                }
            }

            let head = String::from_utf8_lossy(&raw);
            if let Some(id) = head
                .lines()
                .find(|line| line.to_ascii_lowercase().starts_with("x-request-id:"))
                .and_then(|line| line.split_once(':'))
                .map(|(_, value)| value.trim().to_string())
            {
                seen.lock().unwrap().push(id);
            }

            let response = if served < failures_before_success {
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string()
            } else {
                let body = r#"{"status":"healthy"}"#;
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
            };
            served += 1;
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), request_ids)
}

#[tokio::test]
async fn recovers_after_transient_failures_with_fresh_request_ids() {
    let (base_url, request_ids) = flaky_server(3).await;

    let client = NoxRestClient::builder(NoxEnvironment::new(&base_url).unwrap())
        .with_retry_config(fast_retries(3))
        .build()
        .unwrap();

    let health = client.get_health_status().await.unwrap();
    assert_eq!(health.status, "healthy");

    let ids = request_ids.lock().unwrap();
    assert_eq!(ids.len(), 4);
    assert!(ids.iter().all(|id| id.starts_with("req_")));

    // A fresh id is generated per attempt, not reused across retries.
    let mut unique: Vec<&String> = ids.iter().collect();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
}

#[tokio::test]
async fn connection_refused_is_retried_then_surfaces_as_network_error() {
    // Bind and drop to find a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = NoxRestClient::builder(
        NoxEnvironment::new(&format!("http://127.0.0.1:{port}")).unwrap(),
    )
    .with_retry_config(fast_retries(2))
    .build()
    .unwrap();

    let err = client.get_health_status().await.unwrap_err();
    assert!(matches!(err, NoxError::Network(_)));
    assert_eq!(client.metrics().request_count, 3);
}
