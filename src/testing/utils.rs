use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Allocate OS-assigned ports by briefly binding to port 0.
pub(crate) async fn allocate_os_ports(count: usize) -> Vec<u16> {
    let mut ports = Vec::with_capacity(count);
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(listener.local_addr().unwrap().port());
        // Keep each listener until all ports are picked so they differ.
        listeners.push(listener);
    }
    ports
}

/// Wait for a condition with timeout.
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Route test logs through `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
