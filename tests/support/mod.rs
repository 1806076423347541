//! Test helpers.
//!
//! Requires Redis to be installed, so that the tests can start/stop Redis
//! servers as necessary using the `redis-server` binary.

#![allow(dead_code)]

use std::net::TcpListener;
use std::process::{Child, Command, Stdio};

use redqueue::{QueueConfig, QueuePayload, WorkQueue};

/// Owns a throwaway `redis-server` process for one test. The server is
/// started on a free port and killed when the context is dropped, so every
/// test runs against a clean database.
pub struct TestContext {
    port: u16,
    server: Child,
}

impl TestContext {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let port = free_port();
        let server = Command::new("redis-server")
            .args([
                "--port",
                &port.to_string(),
                "--save",
                "",
                "--appendonly",
                "no",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start redis-server, is it installed?");
        let ctx = Self { port, server };
        ctx.wait_until_ready();
        ctx
    }

    pub fn redis_url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    /// Raw async connection for direct store assertions.
    pub async fn connection(&self) -> redis::aio::MultiplexedConnection {
        redis::Client::open(self.redis_url())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap()
    }

    /// Build a queue handle against this server.
    pub fn queue<T: QueuePayload>(&self, config: QueueConfig) -> WorkQueue<T> {
        WorkQueue::builder()
            .redis_url(self.redis_url())
            .config(config)
            .build()
            .unwrap()
    }

    fn wait_until_ready(&self) {
        let client = redis::Client::open(self.redis_url()).unwrap();
        for _ in 0..100 {
            if let Ok(mut conn) = client.get_connection() {
                if redis::cmd("PING").query::<String>(&mut conn).is_ok() {
                    return;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("redis-server did not become ready on port {}", self.port);
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = self.server.kill();
        let _ = self.server.wait();
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
