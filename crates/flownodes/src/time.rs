use async_trait::async_trait;
use flowcore::{HandlerContext, HandlerOutput, NodeError, NodeHandler, Value};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: f64 = 1000.0;

/// Pause the execution for `delay_ms` milliseconds
pub struct Delay;

fn delay_ms(config: &HashMap<String, Value>) -> Result<u64, NodeError> {
    match config.get("delay_ms") {
        None => Ok(DEFAULT_DELAY_MS as u64),
        Some(value) => match value.as_f64() {
            Some(ms) if ms.is_finite() && ms >= 0.0 => Ok(ms as u64),
            _ => Err(NodeError::Configuration(
                "'delay_ms' must be a non-negative number".to_string(),
            )),
        },
    }
}

#[async_trait]
impl NodeHandler for Delay {
    fn handler_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let delay_ms = delay_ms(&ctx.config)?;
        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        sleep(Duration::from_millis(delay_ms)).await;

        Ok(HandlerOutput::new())
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        delay_ms(config).map(|_| ())
    }
}
