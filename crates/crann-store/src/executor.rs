use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crann_core::listener::panic_message;
use crann_core::{
    ActionContext, ConnectionInfo, CrannError, Result, StateMap, StateWriter, StoreConfig,
};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

/// Validates and runs the named actions of one store.
pub struct ActionExecutor {
    config: Arc<StoreConfig>,
}

impl ActionExecutor {
    pub fn new(config: Arc<StoreConfig>) -> Self {
        Self { config }
    }

    /// Run action `name` for `caller`.
    ///
    /// `state` is the snapshot the handler sees; `writer` applies its
    /// `set_state` calls as if `caller` had sent them. Validator and handler
    /// failures, panics included, come back as structured errors.
    pub async fn execute(
        &self,
        name: &str,
        args: Vec<Value>,
        caller: ConnectionInfo,
        state: StateMap,
        writer: Arc<dyn StateWriter>,
    ) -> Result<Value> {
        let store = self.config.name();
        let Some(def) = self.config.action(name) else {
            return Err(CrannError::UnknownAction {
                action: name.to_string(),
                store: store.to_string(),
            });
        };

        if let Some(validator) = def.validator() {
            let verdict = catch_unwind(AssertUnwindSafe(|| validator(args.as_slice())));
            let reason = match verdict {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(&*panic)),
            };
            if let Some(reason) = reason {
                debug!(store, action = name, reason = %reason, "arguments rejected");
                return Err(CrannError::Validation {
                    action: name.to_string(),
                    reason,
                });
            }
        }

        debug!(store, action = name, caller = %caller.id, "running action");
        let ctx = ActionContext::new(state, caller, writer);
        let handler = Arc::clone(def.handler());
        let outcome = match catch_unwind(AssertUnwindSafe(|| handler(ctx, args))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let message = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(&*panic),
        };
        warn!(store, action = name, error = %message, "action failed");
        Err(CrannError::Action {
            action: name.to_string(),
            store: store.to_string(),
            message,
        })
    }
}
