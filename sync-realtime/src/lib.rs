pub mod redis_transport;
pub mod registry;
pub mod stream;

pub use redis_transport::RedisStreamTransport;
pub use registry::{SignalQueue, StreamRegistry};
pub use stream::{ChangeStream, StreamAction, StreamPhase};
