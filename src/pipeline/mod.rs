//! Pipeline orchestration: the conversation loop, turn processing, and
//! the messages that tie the stages together.

pub mod coordinator;
pub mod messages;
pub mod turn;
