//! Job application persistence.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::deadpool::PoolError;
use diesel_async::AsyncConnection;
use parking_lot::Mutex;
use scoped_futures::ScopedFutureExt;

use iris_common::PrefixedId;

use crate::db::pool::DbPool;
use crate::db::schema::job_applications;
use crate::models::job_application::{JobApplication, JobStatus, NewJobApplication};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a job application for this url already exists")]
    DuplicateUrl,
    #[error("job application not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 10;
    pub const MAX_LIMIT: i64 = 100;
    /// Highest page whose offset still fits an `i64` at any limit.
    pub const MAX_PAGE: i64 = i64::MAX / Self::MAX_LIMIT;

    /// Clamp raw query values into a usable page.
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).clamp(1, Self::MAX_PAGE),
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

#[async_trait]
pub trait JobApplicationStore: Send + Sync {
    /// Insert a new application in `processing`. Fails with
    /// [`StoreError::DuplicateUrl`] if the url was already submitted.
    async fn create(&self, url: &str) -> Result<JobApplication, StoreError>;

    /// Newest first, with the total row count.
    async fn list(&self, page: Page) -> Result<(Vec<JobApplication>, i64), StoreError>;

    async fn set_status(&self, id: &str, status: JobStatus)
        -> Result<JobApplication, StoreError>;
}

#[derive(Clone)]
pub struct PgJobStore {
    db: DbPool,
}

impl PgJobStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobApplicationStore for PgJobStore {
    async fn create(&self, url: &str) -> Result<JobApplication, StoreError> {
        let now = Utc::now();
        let id = JobApplication::generate();
        let mut conn = self.db.get().await?;

        let row: JobApplication = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(job_applications::table)
                .values(NewJobApplication {
                    id: &id,
                    url,
                    status: JobStatus::Processing.as_str(),
                    created_at: now,
                    updated_at: now,
                })
                .returning(JobApplication::as_returning()),
            &mut conn,
        )
        .await
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                StoreError::DuplicateUrl
            }
            other => StoreError::Database(other),
        })?;

        Ok(row)
    }

    async fn list(&self, page: Page) -> Result<(Vec<JobApplication>, i64), StoreError> {
        let mut conn = self.db.get().await?;

        // Count and page from the same snapshot.
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let total: i64 = diesel_async::RunQueryDsl::get_result(
                    job_applications::table.count(),
                    conn,
                )
                .await?;

                let rows: Vec<JobApplication> = diesel_async::RunQueryDsl::load(
                    job_applications::table
                        .order(job_applications::created_at.desc())
                        .limit(page.limit)
                        .offset(page.offset())
                        .select(JobApplication::as_select()),
                    conn,
                )
                .await?;

                Ok((rows, total))
            }
            .scope_boxed()
        })
        .await
    }

    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
    ) -> Result<JobApplication, StoreError> {
        let mut conn = self.db.get().await?;

        let row: Option<JobApplication> = diesel_async::RunQueryDsl::get_result(
            diesel::update(job_applications::table.find(id))
                .set((
                    job_applications::status.eq(status.as_str()),
                    job_applications::updated_at.eq(Utc::now()),
                ))
                .returning(JobApplication::as_returning()),
            &mut conn,
        )
        .await
        .optional()?;

        row.ok_or(StoreError::NotFound)
    }
}

/// Process-local store used by tests and local runs without Postgres.
#[derive(Default)]
pub struct MemoryJobStore {
    rows: Mutex<Vec<JobApplication>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobApplicationStore for MemoryJobStore {
    async fn create(&self, url: &str) -> Result<JobApplication, StoreError> {
        let mut rows = self.rows.lock();
        if rows.iter().any(|row| row.url == url) {
            return Err(StoreError::DuplicateUrl);
        }

        let now = Utc::now();
        let row = JobApplication {
            id: JobApplication::generate(),
            url: url.to_string(),
            status: JobStatus::Processing.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn list(&self, page: Page) -> Result<(Vec<JobApplication>, i64), StoreError> {
        let rows = self.rows.lock();
        // Insertion order is creation order; newest first.
        let data = rows
            .iter()
            .rev()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok((data, rows.len() as i64))
    }

    async fn set_status(
        &self,
        id: &str,
        status: JobStatus,
    ) -> Result<JobApplication, StoreError> {
        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound)?;
        row.status = status.as_str().to_string();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}
