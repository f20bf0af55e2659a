pub mod prelude;

pub mod job;
pub mod jobtag;
pub mod tag;
