//! Shared PostgreSQL container for the postgres backend tests.
//!
//! One container is started per test binary; every test gets its own freshly created
//! database inside it, so tests can run in parallel without seeing each other's ledgers.

use std::sync::OnceLock;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Default credentials for testcontainers-modules postgres
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

struct SharedContainer {
    port: u16,
    // The container's cleanup runs on this runtime, so it lives as long as the test binary.
    _runtime: tokio::runtime::Runtime,
}

static CONTAINER: OnceLock<SharedContainer> = OnceLock::new();

fn postgres_port() -> u16 {
    CONTAINER
        .get_or_init(|| {
            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            let port = runtime.block_on(async {
                let container = Postgres::default()
                    .start()
                    .await
                    .expect("failed to start postgres container");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("failed to get postgres port");
                // Leak the container so it outlives every test
                std::mem::forget(container);
                port
            });
            SharedContainer {
                port,
                _runtime: runtime,
            }
        })
        .port
}

fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        postgres_port(),
        db
    )
}

/// Create an empty database with a unique name and connect to it.
pub fn fresh_postgres_db() -> (Client, String) {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");
    let db_name = format!("strata_{}", Uuid::new_v4().simple());
    admin
        .execute(&format!("CREATE DATABASE \"{}\"", db_name), &[])
        .expect("failed to create test database");
    drop(admin);

    let client =
        Client::connect(&url_with_db(&db_name), NoTls).expect("failed to connect to test database");
    (client, db_name)
}

/// A client connected to a fresh, isolated database.
pub fn get_test_client() -> Client {
    fresh_postgres_db().0
}
