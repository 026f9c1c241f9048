//! Publisher-side receiver endpoint: a length-prefixed command loop over a
//! pair of byte streams, plus the session tokens it hands out.

pub mod reactor;
pub mod session_token;

pub use reactor::{read_reply, write_request, Reactor, Request};
pub use session_token::{
    check_token, generate_session_token, get_token_public_id, SessionToken, TokenError,
};
