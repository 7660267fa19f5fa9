//! Persistence layer over PostgreSQL.
//!
//! Concrete stores over a shared `PgPool`, mirroring the operations the
//! orchestrator needs: sessions with leases, an idempotent event log,
//! dedupe-on-insert candidates, and the merchant directory with its
//! process-wide cache.

pub mod candidates;
pub mod directory;
pub mod events;
pub mod migration;
pub mod sessions;

pub use candidates::CandidateStore;
pub use events::EventLog;
pub use sessions::SessionStore;
