pub mod collector;
pub mod labels;
