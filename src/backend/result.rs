// Checked native status codes
//
// A `CheckedResult` holding a failure must be looked at before it is dropped.
// Dropping an unobserved failure hands it to the registered escalation handler,
// or panics when none is registered.

use ash::vk;
use parking_lot::RwLock;
use std::sync::Arc;

use super::error::{GraphicsError, GraphicsResult};

type EscalationHandler = Arc<dyn Fn(vk::Result) + Send + Sync>;

static ESCALATION_HANDLER: RwLock<Option<EscalationHandler>> = RwLock::new(None);

/// Install the handler invoked for failures that were dropped unobserved.
pub fn set_escalation_handler<F>(handler: F)
where
    F: Fn(vk::Result) + Send + Sync + 'static,
{
    *ESCALATION_HANDLER.write() = Some(Arc::new(handler));
}

/// Remove the escalation handler; unobserved failures panic again afterwards.
pub fn clear_escalation_handler() {
    *ESCALATION_HANDLER.write() = None;
}

#[must_use = "a failed CheckedResult escalates if it is dropped unobserved"]
#[derive(Debug)]
pub struct CheckedResult {
    operation: &'static str,
    result: vk::Result,
    observed: bool,
}

impl CheckedResult {
    /// A status with no call attached to it.
    pub fn new(result: vk::Result) -> Self {
        Self::of("VkResult", result)
    }

    /// A status produced by `operation`, which shows up in logs and errors.
    pub fn of(operation: &'static str, result: vk::Result) -> Self {
        Self {
            operation,
            result,
            observed: result == vk::Result::SUCCESS,
        }
    }

    pub fn success() -> Self {
        Self::new(vk::Result::SUCCESS)
    }

    /// Peek without consuming; counts as an observation.
    pub fn get(&mut self) -> vk::Result {
        self.observed = true;
        self.result
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn is_success(&mut self) -> bool {
        self.get() == vk::Result::SUCCESS
    }

    /// Explicitly discard the outcome.
    pub fn ignore(mut self) {
        self.observed = true;
    }

    pub fn into_result(mut self) -> GraphicsResult<()> {
        self.observed = true;
        match self.result {
            vk::Result::SUCCESS => Ok(()),
            result => Err(GraphicsError::vk(self.operation, result)),
        }
    }

    /// Bridge an ash call into a checked status.
    pub fn from_vk<T>(operation: &'static str, outcome: ash::prelude::VkResult<T>) -> Self {
        match outcome {
            Ok(_) => Self::of(operation, vk::Result::SUCCESS),
            Err(result) => Self::of(operation, result),
        }
    }
}

impl From<vk::Result> for CheckedResult {
    fn from(result: vk::Result) -> Self {
        Self::new(result)
    }
}

impl Drop for CheckedResult {
    fn drop(&mut self) {
        if self.observed {
            return;
        }
        log::error!(
            "{} returned {:?}, which was dropped without being checked",
            self.operation,
            self.result
        );

        let handler = ESCALATION_HANDLER.read().clone();
        match handler {
            Some(handler) => handler(self.result),
            // Never panic while already unwinding.
            None if std::thread::panicking() => {}
            None => panic!("{}", GraphicsError::Unobserved(self.result)),
        }
    }
}
