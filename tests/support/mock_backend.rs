//! Mock backend for integration testing
//!
//! Binds `127.0.0.1:$PORT` and answers every request with
//! `<name> <pid> <host>`, where `<name>` is the last command line argument
//! (the script name the launcher appends).

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::env;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    let name = env::args().skip(1).last().unwrap_or_else(|| "backend".to_string());
    let pid = std::process::id();

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("Failed to bind");

    eprintln!("Mock backend {}: listening on port {}", name, port);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("Mock backend {}: accept error: {}", name, e);
                continue;
            }
        };

        let name = name.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let host = req
                    .headers()
                    .get(hyper::header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let body = format!("{} {} {}", name, pid, host);
                async move { Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body)))) }
            });

            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}
