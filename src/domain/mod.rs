/// 领域类型 - 队列信封与负载定义
/// Domain types - queue envelope and payload definitions

pub mod envelope;
pub mod prefs;
pub mod status;

pub use envelope::{
    CleanupPayload, DeliveryReceiptPayload, Envelope, EnvelopePayload, NotificationPayload,
    Priority, ReadReceiptPayload, SendMessagePayload, UpdateStatusPayload,
};
pub use prefs::{NotificationPrefs, QuietHours};
pub use status::MessageStatus;
