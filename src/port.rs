//! Free TCP port discovery
//!
//! The port is only reserved for as long as the temporary listener lives, so a
//! backend racing another process for it may lose. Such a backend fails to
//! bind, exits, and is restarted by its supervisor like any other crash.

use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::debug;

/// Ask the OS for an ephemeral port on `bind` and release it immediately
pub async fn allocate(bind: IpAddr) -> std::io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(bind, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    debug!(%bind, port, "Allocated free port");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_returns_bindable_port() {
        let bind = IpAddr::from([127, 0, 0, 1]);
        let port = allocate(bind).await.unwrap();
        assert_ne!(port, 0);

        // Released on return, so the caller can bind it
        let listener = TcpListener::bind(SocketAddr::new(bind, port)).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_allocate_unassignable_address_fails() {
        // TEST-NET-1 is never a local interface
        let result = allocate(IpAddr::from([192, 0, 2, 1])).await;
        assert!(result.is_err());
    }
}
