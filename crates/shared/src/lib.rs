//! Wire types shared between the chat backend and its clients.

pub mod domain;
pub mod error;
pub mod protocol;
