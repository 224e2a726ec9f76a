//! Pricing endpoint behavior: breakdown arithmetic and the quote cell that
//! cart views read back.

mod common;

use axum::http::{Method, StatusCode};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use common::{decimal_field, grocery_item, read_json, spawn_app};

#[tokio::test]
async fn nyc_destination_below_threshold_pays_tax_and_shipping() {
    let app = spawn_app().await;

    let response = app
        .post_json(
            "/api/pricing/compute",
            None,
            json!({
                "items": [ { "price": "21.00", "quantity": 2 } ],
                "shippingAddress": { "zip": "10001", "state": "NY", "country": "US" },
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let breakdown = read_json(response).await;

    assert_eq!(decimal_field(&breakdown, "subtotal"), dec!(42.00));
    assert_eq!(decimal_field(&breakdown, "taxRate"), dec!(0.08875));
    assert_eq!(decimal_field(&breakdown, "taxAmount"), dec!(3.73));
    assert_eq!(decimal_field(&breakdown, "shippingAmount"), dec!(5.99));
    assert_eq!(decimal_field(&breakdown, "total"), dec!(51.72));
}

#[tokio::test]
async fn threshold_subtotal_ships_free() {
    let app = spawn_app().await;

    let breakdown = read_json(
        app.post_json(
            "/api/pricing/compute",
            None,
            json!({
                "items": [ { "price": "50.00", "quantity": 1 } ],
                "shippingAddress": { "zip": "10001", "state": "NY", "country": "US" },
            }),
        )
        .await,
    )
    .await;

    assert_eq!(decimal_field(&breakdown, "shippingAmount"), dec!(0));
}

#[tokio::test]
async fn empty_item_lists_and_missing_zip_are_rejected() {
    let app = spawn_app().await;

    let response = app
        .post_json(
            "/api/pricing/compute",
            None,
            json!({
                "items": [],
                "shippingAddress": { "zip": "10001", "state": "NY", "country": "US" },
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            "/api/pricing/compute",
            None,
            json!({
                "items": [ { "price": "10.00", "quantity": 1 } ],
                "shippingAddress": { "zip": "  ", "state": "NY", "country": "US" },
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn computed_quote_appears_in_the_owners_cart_view() {
    let app = spawn_app().await;

    let response = app
        .send(
            Method::POST,
            "/api/cart/items",
            None,
            Some("quote-guest"),
            Some(grocery_item(Uuid::new_v4(), "21.00", 2)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    app.send(
        Method::POST,
        "/api/pricing/compute",
        None,
        Some("quote-guest"),
        Some(json!({
            "items": [ { "price": "21.00", "quantity": 2 } ],
            "shippingAddress": { "zip": "10001", "state": "NY", "country": "US" },
        })),
    )
    .await;

    let cart = read_json(
        app.send(Method::GET, "/api/cart", None, Some("quote-guest"), None)
            .await,
    )
    .await;
    let quote = &cart["quote"];
    assert!(!quote.is_null(), "quote should survive for the same owner");
    assert_eq!(decimal_field(quote, "total"), dec!(51.72));
}

#[tokio::test]
async fn cart_mutation_drops_the_stored_quote() {
    let app = spawn_app().await;

    app.send(
        Method::POST,
        "/api/cart/items",
        None,
        Some("mut-guest"),
        Some(grocery_item(Uuid::new_v4(), "21.00", 2)),
    )
    .await;
    app.send(
        Method::POST,
        "/api/pricing/compute",
        None,
        Some("mut-guest"),
        Some(json!({
            "items": [ { "price": "21.00", "quantity": 2 } ],
            "shippingAddress": { "zip": "10001", "state": "NY", "country": "US" },
        })),
    )
    .await;

    // Adding another line invalidates the quote generation.
    app.send(
        Method::POST,
        "/api/cart/items",
        None,
        Some("mut-guest"),
        Some(grocery_item(Uuid::new_v4(), "3.00", 1)),
    )
    .await;

    let cart = read_json(
        app.send(Method::GET, "/api/cart", None, Some("mut-guest"), None)
            .await,
    )
    .await;
    assert!(cart["quote"].is_null());
}

#[tokio::test]
async fn unknown_zip_falls_back_to_the_default_rate() {
    let app = spawn_app().await;

    let breakdown = read_json(
        app.post_json(
            "/api/pricing/compute",
            None,
            json!({
                "items": [ { "price": "10.00", "quantity": 1 } ],
                "shippingAddress": { "zip": "00000", "state": "ZZ", "country": "US" },
            }),
        )
        .await,
    )
    .await;

    assert_eq!(decimal_field(&breakdown, "taxRate"), dec!(0.08));
}
