//! Shipping address book over HTTP.

mod common;

use axum::http::{Method, StatusCode};
use serde_json::{json, Value};

use common::{read_json, spawn_app};

fn address(street: &str, is_default: bool) -> Value {
    json!({
        "street": street,
        "city": "New York",
        "state": "NY",
        "zip": "10001",
        "country": "US",
        "isDefault": is_default,
    })
}

#[tokio::test]
async fn first_address_becomes_the_default() {
    let app = spawn_app().await;
    let (token, _) = app.seed_session("customer").await;

    let response = app
        .post_json("/api/addresses", Some(&token), address("1 First St", false))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    assert_eq!(created["isDefault"], json!(true));
}

#[tokio::test]
async fn default_promotion_demotes_the_previous_default() {
    let app = spawn_app().await;
    let (token, _) = app.seed_session("customer").await;

    let first = read_json(
        app.post_json("/api/addresses", Some(&token), address("1 First St", false))
            .await,
    )
    .await;
    let second = read_json(
        app.post_json("/api/addresses", Some(&token), address("2 Second Ave", false))
            .await,
    )
    .await;
    assert_eq!(second["isDefault"], json!(false));

    let response = app
        .send(
            Method::POST,
            &format!("/api/addresses/{}/default", second["id"].as_str().unwrap()),
            Some(&token),
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let listing = read_json(app.get("/api/addresses", Some(&token)).await).await;
    let listing = listing.as_array().unwrap();
    assert_eq!(listing.len(), 2);
    // Default sorts first.
    assert_eq!(listing[0]["id"], second["id"]);
    assert_eq!(listing[0]["isDefault"], json!(true));
    let demoted = listing.iter().find(|a| a["id"] == first["id"]).unwrap();
    assert_eq!(demoted["isDefault"], json!(false));
}

#[tokio::test]
async fn addresses_are_scoped_to_their_owner() {
    let app = spawn_app().await;
    let (alice, _) = app.seed_session("customer").await;
    let (bob, _) = app.seed_session("customer").await;

    let created = read_json(
        app.post_json("/api/addresses", Some(&alice), address("1 First St", true))
            .await,
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let listing = read_json(app.get("/api/addresses", Some(&bob)).await).await;
    assert!(listing.as_array().unwrap().is_empty());

    let response = app
        .send(
            Method::DELETE,
            &format!("/api/addresses/{}", id),
            Some(&bob),
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_returns_no_content_and_removes_the_row() {
    let app = spawn_app().await;
    let (token, _) = app.seed_session("customer").await;

    let created = read_json(
        app.post_json("/api/addresses", Some(&token), address("1 First St", true))
            .await,
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let response = app
        .send(
            Method::DELETE,
            &format!("/api/addresses/{}", id),
            Some(&token),
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let listing = read_json(app.get("/api/addresses", Some(&token)).await).await;
    assert!(listing.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn blank_fields_fail_validation() {
    let app = spawn_app().await;
    let (token, _) = app.seed_session("customer").await;

    let mut bad = address("", false);
    bad["street"] = json!("");
    let response = app.post_json("/api/addresses", Some(&token), bad).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut bad = address("1 First St", false);
    bad["country"] = json!("USA");
    let response = app.post_json("/api/addresses", Some(&token), bad).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
