//! SNICKER relay server
//!
//! A relay is a dumb bulletin board: proposers POST `base64,hex` records,
//! receivers GET every record ever stored and try to decrypt them locally.

pub mod server;
pub mod store;

pub use server::{router, serve, ErrorBody, ACCEPTED_BODY, INVALID_REQUEST_FORMAT};
pub use store::{BatchRejection, PostOutcome, RelayStore};
