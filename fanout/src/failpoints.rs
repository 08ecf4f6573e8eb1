use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, FanoutResult};

/// Fires before a serialization drain completes and the boundary transaction is released.
pub const SERIALIZATION_BEFORE_RELEASE: &str = "serialization.before_release";

/// Fires in a channel worker before a transaction fragment is handed to the applier.
pub const CHANNEL_WORKER_BEFORE_APPLY: &str = "channel_worker.before_apply";

/// Fires in the feeder worker before an event read from the log is accepted.
pub const FEEDER_BEFORE_ACCEPT: &str = "feeder.before_accept";

/// Evaluates the failpoint `name`, returning an error when it is configured to fail.
pub fn fanout_fail_point(name: &str) -> FanoutResult<()> {
    fail_point!(name, |parameter: Option<String>| {
        let detail = match parameter {
            Some(parameter) => format!("The failpoint '{name}' returned an error: {parameter}"),
            None => format!("The failpoint '{name}' returned an error"),
        };

        bail!(
            ErrorKind::FailpointTriggered,
            "An error occurred in a fail point",
            detail = detail
        );
    });

    Ok(())
}
