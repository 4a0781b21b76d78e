pub mod executor;
pub mod scripts;

pub use executor::Executor;
