//! Domain models for mailbox entities

mod credential;
mod email;
mod message;
mod sync_cursor;
mod thread;
mod user;

pub use credential::{TokenGrant, UserCredential};
pub use email::EmailRecord;
pub use message::{AttachmentRef, MessageHeaders, MessageId, MessageSnapshot};
pub use sync_cursor::SyncCursor;
pub use thread::{ThreadId, ThreadSnapshot};
pub use user::UserId;
