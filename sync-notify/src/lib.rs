pub mod consumer;
pub mod feed;
pub mod service;

pub use consumer::run;
pub use feed::NotificationFeed;
pub use service::NotificationService;
