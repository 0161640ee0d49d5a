//! Process-wide panic logging.
//!
//! Worker threads are isolated from the control loop, so a panic there does
//! not end the process. Panics caused by a stream closing under a writer are
//! an expected part of pipeline teardown and are logged at debug level.

use std::any::Any;

use tracing::{debug, error};

const TEARDOWN_MARKERS: &[&str] = &[
    "broken pipe",
    "channel closed",
    "sending on a closed channel",
    "sending on a disconnected channel",
    "write after end",
    "epipe",
];

pub fn install() {
    std::panic::set_hook(Box::new(|info| {
        let message = payload_message(info.payload());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let thread = std::thread::current().name().unwrap_or("unnamed").to_string();

        if is_teardown_race(&message) {
            debug!(%thread, %location, "Ignoring teardown panic: {}", message);
        } else {
            error!(%thread, %location, "Panic: {}", message);
        }
    }));
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub fn is_teardown_race(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TEARDOWN_MARKERS.iter().any(|marker| message.contains(marker))
}
