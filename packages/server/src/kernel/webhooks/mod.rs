// Webhook intake: signature verification, event persistence and fan-out.

pub mod event;
pub mod receiver;
pub mod signature;

pub use event::{WebhookEvent, WebhookStatus};
pub use receiver::{handle_intake, process_event, IntakeReply, IntakeRequest};
pub use signature::{SignatureKeys, VerifyOutcome};
