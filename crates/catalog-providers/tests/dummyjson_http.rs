use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use catalog_core::ExternalId;
use catalog_providers::{ProductProvider, ProviderError, ProviderRegistry, DUMMYJSON_KEY};
use catalog_storage::{HttpClientConfig, HttpFetcher};
use tokio::net::TcpListener;

const FIXTURE: &str = include_str!("fixtures/dummyjson_products.json");

async fn serve(app: Router) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

fn fetcher(timeout: Duration) -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout,
            ..Default::default()
        })
        .expect("http fetcher"),
    )
}

async fn provider_for(app: Router, timeout: Duration) -> anyhow::Result<Box<dyn ProductProvider>> {
    let addr = serve(app).await?;
    let url = format!("http://{addr}/products");
    Ok(ProviderRegistry::builtin().resolve(DUMMYJSON_KEY, fetcher(timeout), Some(&url))?)
}

#[tokio::test]
async fn fetches_and_normalizes_fixture_payload() -> anyhow::Result<()> {
    let app = Router::new().route(
        "/products",
        get(|| async { ([("content-type", "application/json")], FIXTURE) }),
    );
    let provider = provider_for(app, Duration::from_secs(5)).await?;

    let raw = provider.fetch_raw().await?;
    assert_eq!(raw.len(), 3);

    let products = provider.fetch_and_normalize().await?;
    assert_eq!(products.len(), 3);
    assert_eq!(products[0].external_id, ExternalId::Int(1));
    assert_eq!(products[0].length, Some(23.17));
    assert_eq!(products[0].height, Some(14.43));
    assert_eq!(products[0].depth, Some(28.01));
    assert_eq!(products[2].title, "Powder Canister");
    assert_eq!(products[2].length, Some(0.0));
    Ok(())
}

#[tokio::test]
async fn non_success_status_is_an_upstream_error() -> anyhow::Result<()> {
    let app = Router::new().route(
        "/products",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
    );
    let provider = provider_for(app, Duration::from_secs(5)).await?;

    let err = provider.fetch_raw().await.unwrap_err();
    assert!(matches!(err, ProviderError::Upstream { status: 503, .. }), "{err}");
    Ok(())
}

#[tokio::test]
async fn unexpected_body_is_a_schema_error() -> anyhow::Result<()> {
    let app = Router::new().route("/products", get(|| async { r#"{"items": []}"# }));
    let provider = provider_for(app, Duration::from_secs(5)).await?;

    let err = provider.fetch_raw().await.unwrap_err();
    assert!(matches!(err, ProviderError::Schema(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn slow_upstream_hits_the_timeout_ceiling() -> anyhow::Result<()> {
    let app = Router::new().route(
        "/products",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            FIXTURE
        }),
    );
    let provider = provider_for(app, Duration::from_millis(200)).await?;

    let err = provider.fetch_raw().await.unwrap_err();
    assert!(matches!(err, ProviderError::Network(_)), "{err}");
    Ok(())
}
