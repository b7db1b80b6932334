//! Payload handling module.
//!
//! Provides parsing and lazy row iteration for cyacd2 firmware images.

pub mod cyacd2;

pub use cyacd2::{AppDescriptor, Cyacd2Image, Header, IMAGE_EXTENSION, ImageError, Row, Rows};
