//! Transaction Validation Module
//!
//! Read-only admission checks shared by the grouped selection and the streaming pipeline:
//! destination structure and resolution, sender balance and nonce, and fee-account lookup.

mod validator;
pub use validator::{pending_future_creation, Destination, Validator};
