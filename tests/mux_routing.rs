//! End-to-end routing through the multiplexer.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use mux_runtime::config::{HttpConfig, UnmatchedPolicy};
use mux_runtime::net::ProtocolClass;
use mux_runtime::{HttpServer, Tracer};

mod common;

fn server() -> HttpServer {
    HttpServer::new(&HttpConfig::default(), Tracer::disabled(), &[])
}

#[tokio::test]
async fn http1_request_is_routed_and_answered() {
    let service = common::TestService::start(
        common::listener_config(&[ProtocolClass::Http1], UnmatchedPolicy::Route),
        server(),
    )
    .await;

    let response = common::client().get(service.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.version(), reqwest::Version::HTTP_11);
    assert!(response.headers().contains_key("x-request-id"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn http2_prior_knowledge_is_routed_to_its_own_listener() {
    let service = common::TestService::start(
        common::listener_config(&[ProtocolClass::Http1, ProtocolClass::Http2], UnmatchedPolicy::Route),
        server(),
    )
    .await;

    let client = reqwest::Client::builder()
        .no_proxy()
        .http2_prior_knowledge()
        .build()
        .unwrap();
    let response = client.get(service.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.version(), reqwest::Version::HTTP_2);
}

#[tokio::test]
async fn raw_request_line_gets_an_http_response() {
    let service = common::TestService::start(
        common::listener_config(&[ProtocolClass::Http1], UnmatchedPolicy::Route),
        server(),
    )
    .await;

    let response = common::send_raw(
        service.addr,
        b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "unexpected response: {text}");
    assert!(text.ends_with(r#"{"status":"ok"}"#));
}

#[tokio::test]
async fn garbage_goes_to_the_default_listener_and_loop_survives() {
    let service = common::TestService::start(
        common::listener_config(&[ProtocolClass::Http1, ProtocolClass::Http2], UnmatchedPolicy::Route),
        server(),
    )
    .await;

    for _ in 0..3 {
        let response = common::send_raw(service.addr, b"\x00\x01\x02garbage\r\n").await;
        assert!(response.is_empty());
    }

    let response = common::client().get(service.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn close_policy_closes_unmatched_connections() {
    let service = common::TestService::start(
        common::listener_config(&[ProtocolClass::Http1], UnmatchedPolicy::Close),
        server(),
    )
    .await;

    let response = common::send_raw(service.addr, b"SSH-2.0-OpenSSH_9.6\r\n").await;
    assert!(response.is_empty());

    let response = common::client().get(service.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn slow_connection_times_out_without_blocking_others() {
    let mut config = common::listener_config(&[ProtocolClass::Http1], UnmatchedPolicy::Route);
    config.protocols[0].classify_timeout_ms = 300;
    let service = common::TestService::start(config, server()).await;

    // Two bytes of a request line, then silence.
    let mut slow = TcpStream::connect(service.addr).await.unwrap();
    slow.write_all(b"GE").await.unwrap();

    let response = common::client().get(service.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), slow.read_to_end(&mut buf))
        .await
        .expect("undecided connection must be closed after the classification timeout")
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn shutdown_stops_the_runtime_cleanly() {
    let service = common::TestService::start(
        common::listener_config(&[ProtocolClass::Http1, ProtocolClass::Http2], UnmatchedPolicy::Route),
        server(),
    )
    .await;

    {
        let client = common::client();
        let response = client.get(service.url("/health")).send().await.unwrap();
        assert!(response.status().is_success());
    }

    service.stop().await.unwrap();
}
