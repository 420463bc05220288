mod repository;

pub use repository::SqliteSessionRepository;
