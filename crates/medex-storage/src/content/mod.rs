mod repository;

pub use repository::SqliteContentRepository;
