pub mod audit;
pub mod content_repository;
pub mod runtime_repository;
pub mod session_repository;
pub mod state_repository;

pub use audit::{AuditEvent, AuditSink, NoopAuditSink, RecordingAuditSink};
pub use content_repository::{ContentRepository, PublishedItemFilter, ThemeInfo};
pub use runtime_repository::RuntimeRepository;
pub use session_repository::SessionRepository;
pub use state_repository::StateRepository;

#[cfg(any(test, feature = "testing"))]
pub use content_repository::MockContentRepository;
#[cfg(any(test, feature = "testing"))]
pub use runtime_repository::MockRuntimeRepository;
#[cfg(any(test, feature = "testing"))]
pub use session_repository::MockSessionRepository;
#[cfg(any(test, feature = "testing"))]
pub use state_repository::MockStateRepository;
