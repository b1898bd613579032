//! Small platform helpers.

pub mod browser;

pub use browser::open_browser;
