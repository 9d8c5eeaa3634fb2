//! Helpers for tests that need real HTTP servers.

use std::future::IntoFuture;
use std::net::SocketAddr;

use axum::Router;

use crate::proxy::duplicate::Destination;

/// Serve `app` on an ephemeral local port.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());
    addr
}

/// A local address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn destination(addr: SocketAddr) -> Destination {
    Destination::parse(&addr.to_string()).unwrap()
}
