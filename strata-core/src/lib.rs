//! Database-free half of the strata migration engine: revision
//! identities, migration definitions, the revision graph resolver and
//! the pre-flight validator. Everything in this crate is a pure
//! function over catalog data, which is what makes planning and
//! validation testable without a database.

#![forbid(unsafe_code)]

mod catalog;
mod error;
mod migration;
mod operation;
mod resolver;
mod revision;
mod validator;

pub use catalog::*;
pub use error::*;
pub use migration::*;
pub use operation::*;
pub use resolver::*;
pub use revision::*;
pub use validator::*;
