mod repository;

pub use repository::SqliteStateRepository;
