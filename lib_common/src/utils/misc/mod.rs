/// Id and time helpers.
pub mod utils;
