use rclite::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chatter {
    data: String,
}

impl Message for Chatter {
    const TYPE_NAME: &'static str = "std_msgs::msg::String";
}

/// Talker and listener on one executor, over the in-process transport.
/// Runs until SIGINT/SIGTERM. Pass a config file path to override defaults.
pub fn main() -> anyhow::Result<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => RclConfig::load(path)?,
        None => RclConfig {
            logger: LoggerConfig::from_env(),
            ..RclConfig::default()
        },
    };
    let _log_guard = cfg.logger.init()?;

    let ctx = Context::init(Arc::new(LoopbackTransport::new()), cfg.spin.clone())?;
    ctx.register_type::<Chatter>()?;

    let talker = ctx.create_named_node("talker", cfg.domain_id);
    let listener = ctx.create_named_node("listener", cfg.domain_id);

    ctx.node(&listener)?.create_subscription::<Chatter, _, _>(
        "chatter",
        Qos::default(),
        |msg| tracing::info!("[Listener] heard: {}", msg.data),
    )?;

    let talker_node = ctx.node(&talker)?;
    let publisher = talker_node.create_publisher::<Chatter>("chatter", Qos::default())?;
    {
        let node = Arc::downgrade(&talker_node);
        let mut count = 0u64;
        talker_node.create_timer(Duration::from_millis(500), move || -> RclResult<()> {
            let Some(node) = node.upgrade() else {
                return Ok(());
            };
            count += 1;
            let msg = Chatter {
                data: format!("hello world {count}"),
            };
            tracing::info!("[Talker] publishing: {}", msg.data);
            node.publish(&publisher, &msg)
        })?;
    }

    let executor = SingleThreadedExecutor::new(&ctx);
    executor.add_node(&talker)?;
    executor.add_node(&listener)?;
    executor.spin()?;

    drop(executor);
    ctx.destroy_node(talker)?;
    ctx.destroy_node(listener)?;
    Ok(())
}
