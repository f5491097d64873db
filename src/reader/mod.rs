//! The reader position and page-virtualization engine.

pub mod image_cache;
pub mod page;
pub mod progress;
pub mod progression;
pub mod scroll;
pub mod segments;
pub mod session;
pub mod single_flight;
pub mod text;
pub mod view_items;
