mod catalog;
mod schema;
pub mod schema_file;

pub use catalog::*;
pub use schema::*;
