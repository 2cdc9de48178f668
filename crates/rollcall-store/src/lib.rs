//! rollcall-store: SQLite persistence for the attendance service.
//!
//! Two databases, each behind its own async connection: the school database
//! (users, courses, rosters, attendance ledger) and the encrypted descriptor
//! database (one sealed face embedding per student).

pub mod descriptors;
pub mod school;

pub use descriptors::{DescriptorError, DescriptorStore};
pub use school::{
    Course, Role, RosterMember, SchoolStore, StoreError, StudentRecord, User,
};
