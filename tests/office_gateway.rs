//! Generic-office conversions through an HTTP conversion gateway

#![cfg(unix)]

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::Multipart,
    http::StatusCode,
    routing::post,
    Router,
};
use doc_convert_server::config::BackendConfig;
use doc_convert_server::convert::{BackendClass, Invocation};

use common::TestGateway;

/// Fake gateway: answers with `%PDF-` followed by the uploaded bytes
async fn fake_convert(mut multipart: Multipart) -> (StatusCode, Vec<u8>) {
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("files") {
            let data = field.bytes().await.unwrap();
            let mut pdf = b"%PDF-".to_vec();
            pdf.extend_from_slice(&data);
            return (StatusCode::OK, pdf);
        }
    }
    (StatusCode::BAD_REQUEST, b"missing files field".to_vec())
}

async fn failing_convert() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "LibreOffice is restarting")
}

async fn empty_convert() -> StatusCode {
    StatusCode::OK
}

async fn slow_convert() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(30)).await;
    StatusCode::OK
}

async fn spawn_fake_gateway() -> SocketAddr {
    let app = Router::new()
        .route("/forms/libreoffice/convert", post(fake_convert))
        .route("/broken", post(failing_convert))
        .route("/empty", post(empty_convert))
        .route("/slow", post(slow_convert));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn gateway_for(url: String, timeout: Duration) -> TestGateway {
    TestGateway::with(move |config| {
        config.with_backend(BackendConfig {
            class: BackendClass::GenericOffice,
            enabled: true,
            invocation: Invocation::Gateway { url },
            timeout,
        })
    })
    .await
}

#[tokio::test]
async fn test_gateway_success() {
    let addr = spawn_fake_gateway().await;
    let gateway = gateway_for(
        format!("http://{}/forms/libreoffice/convert", addr),
        Duration::from_secs(10),
    )
    .await;

    let response = gateway.post_file("/convert", "letter.docx", b"hello").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref(), b"%PDF-hello");
    assert!(response.header("content-disposition").contains("letter.pdf"));
    assert_eq!(gateway.leftover_work_areas(), 0);
}

#[tokio::test]
async fn test_gateway_error_status_is_conversion_failed() {
    let addr = spawn_fake_gateway().await;
    let gateway = gateway_for(format!("http://{}/broken", addr), Duration::from_secs(10)).await;

    let response = gateway.post_file("/convert", "letter.docx", b"hello").await;

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    let json = response.json();
    assert_eq!(json["kind"], "ConversionFailed");
    assert_eq!(json["details"], "LibreOffice is restarting");
}

#[tokio::test]
async fn test_gateway_empty_body_is_artifact_missing() {
    let addr = spawn_fake_gateway().await;
    let gateway = gateway_for(format!("http://{}/empty", addr), Duration::from_secs(10)).await;

    let response = gateway.post_file("/convert", "sheet.xlsx", b"hello").await;

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.kind(), "ArtifactMissing");
}

#[tokio::test]
async fn test_gateway_timeout() {
    let addr = spawn_fake_gateway().await;
    let gateway = gateway_for(format!("http://{}/slow", addr), Duration::from_millis(300)).await;

    let response = gateway.post_file("/convert", "sheet.xlsx", b"hello").await;

    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(response.kind(), "ConversionTimeout");
    assert_eq!(gateway.leftover_work_areas(), 0);
}

#[tokio::test]
async fn test_gateway_unreachable_is_conversion_failed() {
    // Bind then drop to get a port nothing listens on
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let gateway = gateway_for(format!("http://{}/convert", addr), Duration::from_secs(10)).await;

    let response = gateway.post_file("/convert", "sheet.xlsx", b"hello").await;

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.kind(), "ConversionFailed");
}
