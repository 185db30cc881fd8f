use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use vacsync_adapters::{load_detail, load_listing, HhApiSource, ListingQuery, LoadError};
use vacsync_storage::{FetchError, HttpClientConfig};

/// Serves one detail payload under `/vacancies/42`; every other path is 503.
async fn serve_api() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind local listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(answer(socket));
        }
    });
    format!("http://{addr}/vacancies")
}

async fn answer(mut socket: TcpStream) {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&chunk[..n]),
        }
    }
    let head = String::from_utf8_lossy(&head).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

    let (status, body) = if path == "/vacancies/42" {
        ("200 OK", r#"{"id": 42, "name": "Rust Engineer", "archived": "false"}"#)
    } else {
        ("503 Service Unavailable", "")
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
}

fn source(base: &str) -> HhApiSource {
    HhApiSource::new(
        base,
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("vacsync-test".to_string()),
        },
    )
    .expect("build source")
}

#[tokio::test]
async fn live_source_decodes_detail_and_maps_status_failures() {
    let base = serve_api().await;
    let source = source(&base);

    let record = load_detail(&source, "42").await.expect("detail served");
    assert_eq!(record.id, "42");
    assert_eq!(record.name.as_deref(), Some("Rust Engineer"));
    assert!(!record.archived);

    let err = load_listing(&source, &ListingQuery::new(0, 10))
        .await
        .expect_err("listing is down");
    match err {
        LoadError::Fetch(FetchError::HttpStatus { status, url }) => {
            assert_eq!(status, 503);
            assert!(url.contains("page=0&per_page=10"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let missing = load_detail(&source, "7").await.expect_err("unknown id");
    assert!(matches!(
        missing,
        LoadError::Fetch(FetchError::HttpStatus { status: 503, .. })
    ));
}
