pub use crate::callback::CallbackResult;
pub use crate::config::{RclConfig, SpinConfig};
pub use crate::context::Context;
pub use crate::error::{HandleKind, RclError, RclResult};
pub use crate::executor::{Executor, SingleThreadedExecutor};
pub use crate::handle::{NodeHandle, PublisherHandle, SubscriptionHandle, TimerHandle};
pub use crate::node::{Node, SpinThread};
pub use crate::transport::{
    Durability, LoopbackTransport, Message, Qos, Reliability, Transport,
};
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{CancelToken, Rate, init_process_token};
