pub mod consumer;
pub mod messages;
pub mod service;
pub mod threads;

pub use consumer::run;
pub use messages::{Applied, DeliveryStatus, MessageEntry, MessageLog};
pub use service::MessagingService;
pub use threads::ThreadList;
