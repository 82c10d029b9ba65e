//! Applies pending diesel migrations for iris-api.
//!
//! Usage:
//!   cargo run -p iris-api --bin iris-migrate
//!   cargo run -p iris-api --bin iris-migrate -- --test
//!
//! `--test` targets the `<name>_test` database instead of `DATABASE_URL`'s own.

use std::path::Path;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use iris_api::config::with_test_db_suffix;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

fn main() {
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path(Path::new(env!("CARGO_MANIFEST_DIR")).join(".env"));
    }

    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL env var is required");
    let url = if std::env::args().any(|arg| arg == "--test") {
        with_test_db_suffix(&url)
    } else {
        url
    };

    let mut conn = PgConnection::establish(&url).expect("failed to connect to database");
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .expect("failed to run migrations");

    match applied.len() {
        0 => println!("Database is up to date."),
        n => {
            for version in &applied {
                println!("  applied {version}");
            }
            println!("{n} migration(s) applied.");
        }
    }
}
