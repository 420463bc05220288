//! Core of the adaptive learning engine: domain model, repository ports,
//! the runtime control plane, knowledge-state algorithms (mastery, revision,
//! Elo, bandit), the adaptive selection engine, the session state machine,
//! and the telemetry update pipeline.
//!
//! Persistence lives behind the port traits; `medex-storage` provides the
//! SQLite implementation and `medex-api` wires everything together.

pub mod analytics;
pub mod bandit;
pub mod domain;
pub mod elo;
pub mod mastery;
pub mod pipeline;
pub mod ports;
pub mod registry;
pub mod revision;
pub mod runtime;
pub mod selection;
pub mod session;

pub use analytics::AnalyticsService;
pub use domain::{EngineError, Result};
pub use pipeline::UpdatePipeline;
pub use ports::{
    AuditEvent, AuditSink, ContentRepository, NoopAuditSink, PublishedItemFilter,
    RuntimeRepository, SessionRepository, StateRepository, ThemeInfo,
};
pub use runtime::{ApprovalService, RuntimeControl};
pub use selection::SelectionEngine;
pub use session::SessionService;
