pub mod engine;
pub mod scan;

pub use engine::TableEngine;
pub use scan::TableScan;
