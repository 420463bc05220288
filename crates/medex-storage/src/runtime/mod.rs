mod repository;

pub use repository::SqliteRuntimeRepository;
