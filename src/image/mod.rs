//! Image reference handling
//!
//! [`mirror`] derives the mirrored location of an image from its raw reference
//! string and never fails. [`reference`] parses references into the parts the
//! registry client needs.

pub mod mirror;
pub mod reference;

pub use mirror::MirrorNaming;
pub use reference::ImageReference;
