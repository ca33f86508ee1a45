pub mod content;
pub mod protocol;
pub mod types;
