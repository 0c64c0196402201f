//! End-to-end verification of RS256 tokens against a JWKS endpoint.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use gatehouse_auth::identity::JwksConfig;
use gatehouse_auth::{IdentityVerifier, JwksKeySource, JwtIdentityVerifier, VerifyError};
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{TestKey, jwks, now, primary_key, rotated_key};

const PROJECT: &str = "demo-project";

fn claims(sub: &str) -> Value {
    json!({
        "iss": format!("https://securetoken.google.com/{PROJECT}"),
        "aud": PROJECT,
        "sub": sub,
        "iat": now() - 5,
        "exp": now() + 3600,
    })
}

fn verifier(server: &MockServer, config: JwksConfig) -> JwtIdentityVerifier {
    let uri = Url::parse(&format!("{}/jwks", server.uri())).unwrap();
    let keys = JwksKeySource::new(uri, config.with_allow_http(true)).unwrap();
    JwtIdentityVerifier::firebase(Arc::new(keys), PROJECT)
}

fn jwks_response(keys: &[&TestKey]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Cache-Control", "public, max-age=3600")
        .set_body_json(jwks(keys))
}

#[tokio::test]
async fn verifies_token_and_caches_keys() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(jwks_response(&[primary_key()]))
        .expect(1)
        .mount(&server)
        .await;

    let verifier = verifier(&server, JwksConfig::new());
    let token = primary_key().sign(&claims("alice"));

    let first = verifier.verify(&token).await.unwrap();
    let second = verifier.verify(&token).await.unwrap();

    assert_eq!(first.subject, "alice");
    assert_eq!(second.subject, "alice");
}

#[tokio::test]
async fn unknown_kid_refetch_is_throttled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(jwks_response(&[primary_key()]))
        .expect(1)
        .mount(&server)
        .await;

    let verifier = verifier(&server, JwksConfig::new());
    verifier
        .verify(&primary_key().sign(&claims("alice")))
        .await
        .unwrap();

    // Signed by a key the JWKS does not list; the cache was just filled, so no refetch.
    for _ in 0..5 {
        let err = verifier
            .verify(&rotated_key().sign(&claims("mallory")))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Forbidden { .. }));
    }
}

#[tokio::test]
async fn rotated_key_is_picked_up_on_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(jwks_response(&[primary_key()]))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(jwks_response(&[primary_key(), rotated_key()]))
        .mount(&server)
        .await;

    let verifier = verifier(
        &server,
        JwksConfig::new().with_min_refresh_interval(Duration::ZERO),
    );

    verifier
        .verify(&primary_key().sign(&claims("alice")))
        .await
        .unwrap();
    let identity = verifier
        .verify(&rotated_key().sign(&claims("bob")))
        .await
        .unwrap();
    assert_eq!(identity.subject, "bob");
}

#[tokio::test]
async fn unreachable_jwks_is_forbidden() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let verifier = verifier(&server, JwksConfig::new());
    let err = verifier
        .verify(&primary_key().sign(&claims("alice")))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Forbidden { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn jwks_outage_costs_one_fetch_for_concurrent_callers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let verifier = Arc::new(verifier(&server, JwksConfig::new()));
    let token = primary_key().sign(&claims("alice"));
    let started = Instant::now();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let verifier = Arc::clone(&verifier);
            let token = token.clone();
            tokio::spawn(async move { verifier.verify(&token).await })
        })
        .collect();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, VerifyError::Forbidden { .. }));
    }

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn expired_keys_are_served_while_jwks_is_down() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "max-age=1")
                .set_body_json(jwks(&[primary_key()])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let verifier = verifier(
        &server,
        JwksConfig::new()
            .with_min_ttl(Duration::ZERO)
            .with_min_refresh_interval(Duration::ZERO),
    );
    let token = primary_key().sign(&claims("alice"));

    verifier.verify(&token).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let identity = verifier.verify(&token).await.unwrap();

    assert_eq!(identity.subject, "alice");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn token_for_other_project_is_forbidden() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(jwks_response(&[primary_key()]))
        .mount(&server)
        .await;

    let verifier = verifier(&server, JwksConfig::new());
    let mut other = claims("alice");
    other["aud"] = json!("other-project");
    other["iss"] = json!("https://securetoken.google.com/other-project");

    let err = verifier
        .verify(&primary_key().sign(&other))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Forbidden { .. }));
}
