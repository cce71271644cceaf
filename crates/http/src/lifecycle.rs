//! Ordered start/stop hooks.
//!
//! Hooks run in registration order at startup and in reverse order at
//! shutdown. A failing hook is logged and ignored unless it is marked
//! critical, in which case startup aborts: hooks that already started are
//! stopped in reverse, and the failure propagates out of `start()`.

use std::sync::Arc;

use tracing::{error, warn};

use crate::protocol::BoxError;
use crate::protocol::attributes::ServerHandle;

/// A start/stop participant of the server lifecycle.
pub trait LifecycleHook: Send + Sync {
    fn on_start(&self, _server: &ServerHandle) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_stop(&self, _server: &ServerHandle) {}

    /// Whether a start failure of this hook aborts the server.
    fn critical(&self) -> bool {
        false
    }
}

/// Marks a hook as critical: its start failure aborts the server.
pub struct Critical<H>(pub H);

impl<H: LifecycleHook> LifecycleHook for Critical<H> {
    fn on_start(&self, server: &ServerHandle) -> Result<(), BoxError> {
        self.0.on_start(server)
    }

    fn on_stop(&self, server: &ServerHandle) {
        self.0.on_stop(server);
    }

    fn critical(&self) -> bool {
        true
    }
}

/// Hook built from a pair of closures.
pub struct HookFn<S, T> {
    start: S,
    stop: T,
}

/// Builds a hook from start and stop closures.
pub fn hook_fn<S, T>(start: S, stop: T) -> HookFn<S, T>
where
    S: Fn(&ServerHandle) -> Result<(), BoxError> + Send + Sync,
    T: Fn(&ServerHandle) + Send + Sync,
{
    HookFn { start, stop }
}

impl<S, T> LifecycleHook for HookFn<S, T>
where
    S: Fn(&ServerHandle) -> Result<(), BoxError> + Send + Sync,
    T: Fn(&ServerHandle) + Send + Sync,
{
    fn on_start(&self, server: &ServerHandle) -> Result<(), BoxError> {
        (self.start)(server)
    }

    fn on_stop(&self, server: &ServerHandle) {
        (self.stop)(server);
    }
}

pub(crate) fn run_start_hooks(hooks: &[Arc<dyn LifecycleHook>], server: &ServerHandle) -> Result<(), BoxError> {
    for (started, hook) in hooks.iter().enumerate() {
        if let Err(cause) = hook.on_start(server) {
            if hook.critical() {
                error!(server = server.id(), cause = %cause, "critical lifecycle hook failed, aborting startup");
                for hook in hooks[..started].iter().rev() {
                    hook.on_stop(server);
                }
                return Err(cause);
            }
            warn!(server = server.id(), cause = %cause, "lifecycle hook failed to start, ignoring");
        }
    }
    Ok(())
}

pub(crate) fn run_stop_hooks(hooks: &[Arc<dyn LifecycleHook>], server: &ServerHandle) {
    for hook in hooks.iter().rev() {
        hook.on_stop(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn handle() -> ServerHandle {
        ServerHandle::new(0, SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), CancellationToken::new())
    }

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl LifecycleHook for Recording {
        fn on_start(&self, _server: &ServerHandle) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail { Err("boom".into()) } else { Ok(()) }
        }

        fn on_stop(&self, _server: &ServerHandle) {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
        }
    }

    #[test]
    fn start_in_order_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn LifecycleHook>> = vec![
            Arc::new(Recording { name: "a", log: Arc::clone(&log), fail: false }),
            Arc::new(Recording { name: "b", log: Arc::clone(&log), fail: false }),
        ];

        let server = handle();
        run_start_hooks(&hooks, &server).unwrap();
        run_stop_hooks(&hooks, &server);

        assert_eq!(*log.lock().unwrap(), vec!["start:a", "start:b", "stop:b", "stop:a"]);
    }

    #[test]
    fn non_critical_failure_is_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn LifecycleHook>> = vec![
            Arc::new(Recording { name: "a", log: Arc::clone(&log), fail: true }),
            Arc::new(Recording { name: "b", log: Arc::clone(&log), fail: false }),
        ];

        run_start_hooks(&hooks, &handle()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["start:a", "start:b"]);
    }

    #[test]
    fn critical_failure_aborts_and_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn LifecycleHook>> = vec![
            Arc::new(Recording { name: "a", log: Arc::clone(&log), fail: false }),
            Arc::new(Critical(Recording { name: "b", log: Arc::clone(&log), fail: true })),
            Arc::new(Recording { name: "c", log: Arc::clone(&log), fail: false }),
        ];

        assert!(run_start_hooks(&hooks, &handle()).is_err());
        assert_eq!(*log.lock().unwrap(), vec!["start:a", "start:b", "stop:a"]);
    }
}
