pub mod archiver;
pub mod job;
pub mod metric_data;
pub mod tag;
pub mod types;
