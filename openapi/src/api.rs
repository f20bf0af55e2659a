pub mod job;
pub mod tag;

use poem_openapi::Tags;

#[derive(Tags)]
pub enum Tag {
    Job,
    Tag,
}
