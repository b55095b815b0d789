// Common types shared across the application

pub mod envelope;

pub use envelope::{ApiError, Envelope, RequestId};
