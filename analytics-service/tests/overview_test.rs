mod common;

use analytics_service::models::InvoiceStatus;
use chrono::{Duration, Utc};
use common::TestApp;
use serde_json::Value;

#[tokio::test]
async fn overview_requires_org_header() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/analytics/overview"))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn empty_org_returns_zeros() {
    let app = TestApp::spawn().await;

    let response = app.get("/analytics/overview").await;
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["window_days"], 30);
    assert_eq!(body["revenue"]["total_revenue"], 0.0);
    assert_eq!(body["revenue"]["revenue_growth"], 0.0);
    assert_eq!(body["revenue"]["collection_rate"], 0.0);
    assert_eq!(body["revenue"]["average_invoice_value"], 0.0);
    assert_eq!(body["aging"].as_array().unwrap().len(), 4);
    assert_eq!(body["aging"][0]["bucket"], "1-30 days");
}

#[tokio::test]
async fn overview_reports_growth_and_distribution() {
    let app = TestApp::spawn().await;
    let now = Utc::now();
    app.seed_customer("c1", "Acme Print").await;

    for invoice in [
        app.invoice("c1", 6_000.0, InvoiceStatus::Paid, now - Duration::days(1)),
        app.invoice("c1", 3_000.0, InvoiceStatus::Paid, now - Duration::days(5)),
        app.invoice("c2", 1_000.0, InvoiceStatus::Sent, now - Duration::days(7)),
        app.invoice("c2", 8_000.0, InvoiceStatus::Paid, now - Duration::days(40)),
    ] {
        app.store.insert_invoice(invoice).await;
    }

    let body: Value = app.get("/analytics/overview?days=30").await.json().await.unwrap();

    assert_eq!(body["revenue"]["total_revenue"], 10_000.0);
    assert_eq!(body["revenue"]["revenue_growth"], 25.0);
    assert_eq!(body["revenue"]["collection_rate"], 90.0);
    assert_eq!(body["revenue"]["invoice_count"], 3);

    let distribution = body["status_distribution"].as_array().unwrap();
    let paid = distribution
        .iter()
        .find(|entry| entry["status"] == "paid")
        .expect("paid status present");
    assert_eq!(paid["count"], 3);
    assert_eq!(paid["percentage"], 75.0);

    // Equal totals rank by customer id.
    assert_eq!(body["top_customers"][0]["customer_id"], "c1");
    assert_eq!(body["top_customers"][0]["name"], "Acme Print");
    assert_eq!(body["top_customers"][1]["customer_id"], "c2");
    assert!(body["top_customers"][1]["name"].is_null());
    assert_eq!(body["recent_invoices"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn overview_rejects_out_of_range_window() {
    let app = TestApp::spawn().await;

    assert_eq!(app.get("/analytics/overview?days=0").await.status().as_u16(), 422);
    assert_eq!(
        app.get("/analytics/overview?days=5000").await.status().as_u16(),
        422
    );
}

#[tokio::test]
async fn overview_is_cached_until_invalidated() {
    let app = TestApp::spawn().await;
    let now = Utc::now();
    app.store
        .insert_invoice(app.invoice("c1", 100.0, InvoiceStatus::Sent, now - Duration::days(1)))
        .await;

    let first = app.get("/analytics/overview").await;
    assert_eq!(first.headers()["x-cache"], "miss");

    // A write the cache does not know about yet.
    app.store
        .insert_invoice(app.invoice("c1", 400.0, InvoiceStatus::Sent, now - Duration::days(1)))
        .await;

    let second = app.get("/analytics/overview").await;
    assert_eq!(second.headers()["x-cache"], "hit");
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["revenue"]["total_revenue"], 100.0);

    let invalidated: Value = app.delete("/analytics/cache").await.json().await.unwrap();
    assert_eq!(invalidated["invalidated"], 1);

    let third = app.get("/analytics/overview").await;
    assert_eq!(third.headers()["x-cache"], "miss");
    let body: Value = third.json().await.unwrap();
    assert_eq!(body["revenue"]["total_revenue"], 500.0);
}
