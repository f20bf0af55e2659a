pub use super::job::Entity as Job;
pub use super::jobtag::Entity as Jobtag;
pub use super::tag::Entity as Tag;
