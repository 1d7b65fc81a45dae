//! Wire protocol between sensor nodes and the server
//!
//! Topic names, payload schemas and the validation rules applied before
//! anything is handed to the broker.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
