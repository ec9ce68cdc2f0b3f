pub mod chatroom;
pub mod message;
