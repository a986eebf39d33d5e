pub mod cases;
pub mod pool;
pub mod reports;

pub use cases::PgCaseSource;
pub use pool::create_pool;
