//! Multi-tenant background job queue.
//!
//! ## Design
//!
//! - Jobs are org-scoped and typed; the payload is a tagged union per type
//! - The store is the only shared mutable state; components talk through it
//! - Claims are atomic and fenced: every claim and every revocation bumps
//!   `lock_token`, and result writes carry the token seen at claim time
//! - Failed attempts retry with capped exponential backoff until
//!   `max_retries` is used up
//! - Cancellation is cooperative
//!
//! ## Components
//!
//! - `JobStore`: persistence (`InMemoryJobStore`, `PostgresJobStore`)
//! - `Scheduler`: priority-ordered claiming
//! - `WorkerPool`: execution slots with timeout and lease watch
//! - `RetryPolicy`: backoff and the retry/fail decision
//! - `StallDetector`: recovers attempts that outlived their timeout
//! - `BulkCoordinator`: cancel/retry/delete/restart over many ids
//! - `JobQueueService`: the facade the application uses

pub mod bulk;
pub mod executor;
pub mod handler;
pub mod lifecycle;
pub mod payload;
pub mod postgres;
pub mod query;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod stall;
pub mod store;
pub mod types;

pub use bulk::{BulkCoordinator, BulkItemOutcome, BulkOperation, BulkRequest, BulkSummary};
pub use executor::{AttemptOutcome, PoolStats, WorkerPool, WorkerPoolHandle};
pub use handler::{
    BulkAssignmentHandler, EmailAssigner, ExecutionError, HandlerRegistry, JobContext, JobHandler,
    RetentionCleanupHandler,
};
pub use lifecycle::{ControlAction, StatusUpdate};
pub use payload::JobData;
pub use postgres::PostgresJobStore;
pub use query::{JobFilter, JobPage, OneOrMany, Pagination, SortField, SortOrder};
pub use retry::{BackoffStrategy, FailureDecision, RetryPolicy};
pub use scheduler::Scheduler;
pub use service::{JobQueueHandle, JobQueueService, SubmitJobRequest};
pub use stall::{StallDetector, StallDetectorHandle, SweepReport};
pub use store::{
    ClaimRequest, InMemoryJobStore, JobStats, JobStore, JobStoreError, Lease, UpdateOutcome,
};
pub use types::{
    Job, JobAttempt, JobId, JobMetadata, JobPriority, JobProgress, JobStatus, JobType, NewJob,
    ValidationError,
};
