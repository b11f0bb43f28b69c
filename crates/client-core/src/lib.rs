//! On-disk user configuration shared by the `pubforge` binary and engine.

pub mod credentials;
pub mod token;
