pub mod archive;
pub mod cache;
pub mod clusters;
pub mod config;
pub mod error;
pub mod logic;
pub mod metricdata;
pub mod schema;
pub mod state;
pub mod ui;

pub use entity;
