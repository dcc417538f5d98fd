pub mod conversation;
pub mod tool;
