#![allow(dead_code)]

use std::{io, net::TcpListener, time::Duration};

use docdbx::{config::Config, server};
use reqwest::{Client, Method};
use tempfile::TempDir;
use tokio::{task::JoinHandle, time::sleep};

pub const PERMISSIVE_SCHEMA: &str = r#"{"type": "object"}"#;

pub struct TestServer {
    pub base: String,
    handle: JoinHandle<docdbx::error::Result<()>>,
    _temp: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server() -> TestServer {
    spawn_custom(PERMISSIVE_SCHEMA, 15).await
}

pub async fn spawn_custom(schema: &str, keep_alive_secs: u64) -> TestServer {
    let temp = TempDir::new().expect("create temp dir");
    let schema_path = temp.path().join("schema.json");
    std::fs::write(&schema_path, schema).expect("write schema file");

    let mut config = Config::default();
    config.port = allocate_port().expect("allocate port");
    config.schema_path = Some(schema_path);
    config.keep_alive_secs = keep_alive_secs;

    let base = format!("http://127.0.0.1:{}", config.port);
    let handle = tokio::spawn(server::run(config));
    wait_until_ready(&base).await;

    TestServer {
        base,
        handle,
        _temp: temp,
    }
}

fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn wait_until_ready(base: &str) {
    let client = Client::new();
    for _ in 0..50 {
        let probe = client
            .request(Method::OPTIONS, format!("{base}/v1/"))
            .send()
            .await;
        if let Ok(resp) = probe {
            if resp.status().is_success() {
                return;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("server did not become ready in time");
}

pub async fn login(client: &Client, base: &str) -> String {
    let body: serde_json::Value = client
        .post(format!("{base}/auth"))
        .json(&serde_json::json!({"username": "tester"}))
        .send()
        .await
        .expect("auth request sent")
        .error_for_status()
        .expect("auth accepted")
        .json()
        .await
        .expect("auth response parses");
    body["token"]
        .as_str()
        .expect("token present")
        .to_string()
}
