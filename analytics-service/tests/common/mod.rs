#![allow(dead_code)]

use analytics_service::config::{
    AnalyticsConfig, CacheConfig, MongoConfig, StoreBackend, StoreConfig,
};
use analytics_service::models::{Customer, Invoice, InvoiceStatus, LineItem};
use analytics_service::services::InMemoryRecordStore;
use analytics_service::startup::Application;
use chrono::{DateTime, Duration, Utc};
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use std::sync::Arc;
use uuid::Uuid;

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub org_id: String,
    pub store: InMemoryRecordStore,
    pub client: reqwest::Client,
}

fn test_config() -> AnalyticsConfig {
    AnalyticsConfig {
        common: CoreConfig {
            port: 0, // Random port for testing
            log_level: "warn".to_string(),
            environment: "test".to_string(),
        },
        mongodb: MongoConfig {
            uri: Secret::new("mongodb://localhost:27017".to_string()),
            database: "analytics_test".to_string(),
        },
        store: StoreConfig {
            backend: StoreBackend::Memory,
            timeout_seconds: 5,
        },
        cache: CacheConfig {
            enabled: true,
            ttl_seconds: 300,
            purge_interval_seconds: 60,
        },
        redis: None,
        otlp_endpoint: None,
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        let store = InMemoryRecordStore::new();

        let app = Application::build_with_store(test_config(), Arc::new(store.clone()))
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            org_id: format!("org-{}", Uuid::new_v4()),
            store,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// GET as the test organization.
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("X-Org-ID", &self.org_id)
            .header("X-User-ID", "user-1")
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .header("X-Org-ID", &self.org_id)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("X-Session-ID", "session-1")
            .header("X-Forwarded-For", "198.51.100.4, 10.0.0.2")
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub fn invoice(
        &self,
        customer_id: &str,
        total: f64,
        status: InvoiceStatus,
        created_at: DateTime<Utc>,
    ) -> Invoice {
        Invoice {
            id: Uuid::new_v4().to_string(),
            org_id: self.org_id.clone(),
            customer_id: customer_id.to_string(),
            invoice_number: format!("INV-{}", &Uuid::new_v4().to_string()[..8]),
            status,
            items: vec![LineItem::new("Consulting", 1.0, total)],
            tax_amount: 0.0,
            discount_amount: 0.0,
            total,
            issue_date: created_at,
            due_date: created_at + Duration::days(30),
            created_at,
            updated_at: created_at,
            paid_at: None,
        }
    }

    pub async fn seed_customer(&self, id: &str, name: &str) {
        self.store
            .insert_customer(Customer {
                id: id.to_string(),
                org_id: self.org_id.clone(),
                name: name.to_string(),
                email: format!("{}@example.test", id),
                outstanding_balance: 0.0,
                is_active: true,
            })
            .await;
    }
}
