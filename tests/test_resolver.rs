//! Redirect resolution against a mock storage-facing endpoint.

use artifact_transfer::{RedirectResolver, TransferError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resolver(max_redirects: usize) -> RedirectResolver {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    RedirectResolver::with_client(client, max_redirects)
}

#[tokio::test]
async fn resolves_through_redirect_chain() {
    let server = MockServer::start().await;

    // absolute redirect, then a host-relative one, then the terminal response
    Mock::given(method("GET"))
        .and(path("/repo/artifact.zip"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("{}/hop", server.uri()).as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hop"))
        .respond_with(ResponseTemplate::new(307).insert_header("Location", "/direct/artifact.zip"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/direct/artifact.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "12345")
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("ETag", "\"cafebabe\"")
                .set_body_bytes(vec![0u8; 12345]),
        )
        .mount(&server)
        .await;

    let source = resolver(10)
        .resolve(&format!("{}/repo/artifact.zip", server.uri()))
        .await
        .unwrap();

    assert_eq!(source.direct_url, format!("{}/direct/artifact.zip", server.uri()));
    assert_eq!(source.content_length, Some(12345));
    assert!(source.accepts_ranges);
    assert_eq!(source.digest.as_deref(), Some("cafebabe"));
}

#[tokio::test]
async fn fails_beyond_max_redirects() {
    let server = MockServer::start().await;

    // every hop points back at itself
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/loop"))
        .mount(&server)
        .await;

    let err = resolver(3)
        .resolve(&format!("{}/loop", server.uri()))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::TooManyRedirects { max: 3 }));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn fails_on_redirect_without_location() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(302))
        .mount(&server)
        .await;

    let err = resolver(10)
        .resolve(&format!("{}/broken", server.uri()))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::MissingLocation { status: 302 }));
}

#[tokio::test]
async fn classifies_server_errors_as_recoverable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = resolver(10)
        .resolve(&format!("{}/flaky", server.uri()))
        .await
        .unwrap_err();

    match err {
        TransferError::HttpStatus { status, .. } => {
            assert_eq!(status, 503);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn missing_length_and_ranges_are_reported() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/opaque"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let source = resolver(10)
        .resolve(&format!("{}/opaque", server.uri()))
        .await
        .unwrap();

    // body-less mock response advertises Content-Length: 0
    assert!(source.content_length.unwrap_or(0) == 0);
    assert!(!source.accepts_ranges);
    assert!(source.digest.is_none());
}

#[tokio::test]
async fn interrupted_resolver_refuses_new_requests() {
    let server = MockServer::start().await;
    let r = resolver(10);
    r.interrupt();

    let err = r
        .resolve(&format!("{}/anything", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Interrupted));
}

#[tokio::test]
async fn fetch_digest_uses_head() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/object"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"deadbeef\""))
        .mount(&server)
        .await;

    let digest = resolver(10)
        .fetch_digest(&format!("{}/object", server.uri()))
        .await
        .unwrap();
    assert_eq!(digest.as_deref(), Some("deadbeef"));
}
