//! Minimal stand-in backend for integration tests. Reads `--host`/`--port`
//! from argv (the same flags `build_command` emits), answers `/health` and
//! `/v1/models` with 200, and echoes the body of anything else. An
//! optional `STARTUP_DELAY_MS` env var holds off accepting connections, to
//! exercise the on-demand start wait and startup-timeout paths. An optional
//! `EXIT_IMMEDIATELY=1` env var exits before binding at all, to exercise
//! the starting-phase auto-restart path. Raw-HTTP, no websocket upgrade.

use std::env;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let mut host = "127.0.0.1".to_string();
    let mut port: u16 = 0;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                host = args.get(i + 1).cloned().unwrap_or(host);
                i += 1;
            }
            "--port" => {
                port = args
                    .get(i + 1)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(port);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    if env::var("EXIT_IMMEDIATELY").as_deref() == Ok("1") {
        std::process::exit(1);
    }

    if let Ok(delay) = env::var("STARTUP_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
    }

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .expect("mock_backend: failed to bind");

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(v) => v,
            Err(_) => continue,
        };
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            let mut lines = request.lines();
            let request_line = lines.next().unwrap_or("");
            let mut parts = request_line.split_whitespace();
            let _method = parts.next().unwrap_or("");
            let path = parts.next().unwrap_or("/");

            let body = match path {
                "/health" => r#"{"status":"ok"}"#.to_string(),
                "/v1/models" => r#"{"object":"list","data":[]}"#.to_string(),
                _ => r#"{"echo":true}"#.to_string(),
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}
