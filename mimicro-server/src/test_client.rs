//! Minimal HTTP client used by tests that talk to real listeners

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Size of the file served by [`LARGE_FILE_CONFIG`]; far more than socket
/// buffers hold, so a client that stops reading stalls the server's writes
pub const LARGE_FILE_SIZE: usize = 32 * 1024 * 1024;

/// One server streaming `large.bin` from the config directory
pub const LARGE_FILE_CONFIG: &str = r#"
[management]
port = 0

[[servers]]
name = "large"
bind_address = "127.0.0.1"
port = 0

[[servers.endpoints]]
url = "/large"

[servers.endpoints.GET]
body = "file://large.bin"
"#;

/// Send a body-less request and return status, content type and body text
pub async fn send(method: Method, uri: &str) -> (StatusCode, Option<String>, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Empty::new())
        .unwrap();

    let response = client.request(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .map(|value| value.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes();

    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

/// Fresh directory holding `large.bin` of [`LARGE_FILE_SIZE`] bytes
pub fn large_file_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mimicro-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("large.bin"), vec![b'x'; LARGE_FILE_SIZE]).unwrap();
    dir
}

/// Send `GET path` over a raw connection without reading the response
pub async fn raw_get(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, addr);
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

/// Whether `response` ends with the last chunk of a chunked body
pub fn is_complete_chunked(response: &[u8]) -> bool {
    response.ends_with(b"\r\n0\r\n\r\n")
}
