//! Bidirectional byte relay between an accepted client and a backend.

use tokio::net::TcpStream;
use tracing::debug;

use super::counters::CounterGuard;

/// Relay bytes in both directions until either side finishes.
///
/// The first direction to hit EOF or an error ends the splice; both
/// connections are dropped together and the counter slot is released exactly
/// once. I/O errors are logged, never surfaced.
pub async fn splice(mut client: TcpStream, mut backend: TcpStream, guard: CounterGuard) {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let client_to_backend = async {
        tokio::io::copy(&mut client_read, &mut backend_write).await
    };
    let backend_to_client = async {
        tokio::io::copy(&mut backend_read, &mut client_write).await
    };

    tokio::select! {
        result = client_to_backend => log_direction("client->backend", result),
        result = backend_to_client => log_direction("backend->client", result),
    }

    drop(guard);
}

fn log_direction(direction: &'static str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(direction, bytes, "relay direction finished"),
        Err(e) => debug!(direction, error = %e, "relay direction failed"),
    }
}
