//! Stamp Annotator
//!
//! Imports photos of stamp pages, locates rectangular stamp regions and
//! attaches looked-up information to each region.

pub mod config;
pub mod geometry;
pub mod lookup;
pub mod session;
pub mod storage;
pub mod vision;

pub use session::{AnnotationSession, SessionError, SessionUpdate};
