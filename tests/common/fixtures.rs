//! Fixture file servers and canned providers.

use axum::body::{Body, Bytes};
use axum::extract::Path;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use nimbus_fetch::download::DownloadItem;
use nimbus_fetch::providers::{ProductRef, StaticProvider};
use std::time::Duration;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind fixture server");
    let addr = listener.local_addr().expect("No local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Fixture server died");
    });
    format!("http://{}", addr)
}

/// Serves 100 deterministic bytes per file under `/files/:name`.
pub async fn spawn_file_server() -> String {
    let router = Router::new().route(
        "/files/:name",
        get(|Path(name): Path<String>| async move {
            name.bytes().cycle().take(100).collect::<Vec<u8>>()
        }),
    );
    serve(router).await
}

/// Serves an effectively endless trickle of bytes so downloads stay in
/// flight until cancelled.
pub async fn spawn_slow_file_server(chunks: usize, delay: Duration) -> String {
    let router = Router::new().route(
        "/files/:name",
        get(move |Path(_name): Path<String>| async move {
            let stream = futures::stream::unfold(0usize, move |sent| async move {
                if sent >= chunks {
                    return None;
                }
                tokio::time::sleep(delay).await;
                Some((Ok::<_, std::io::Error>(Bytes::from(vec![9u8; 256])), sent + 1))
            });
            Response::builder()
                .status(200)
                .body(Body::from_stream(stream))
                .unwrap()
        }),
    );
    serve(router).await
}

/// A provider whose products each resolve to one file on the fixture
/// server. `products` pairs are `(product_id, file_name)`.
pub fn provider_with_files(name: &str, base_url: &str, products: &[(&str, &str)]) -> StaticProvider {
    let mut provider = StaticProvider::new(name);
    for (product_id, file_name) in products {
        provider = provider.with_product(
            ProductRef::new(*product_id, *product_id),
            vec![DownloadItem {
                url: format!("{}/files/{}", base_url, file_name),
                file_name: file_name.to_string(),
            }],
        );
    }
    provider
}
