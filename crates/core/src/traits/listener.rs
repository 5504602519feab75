use linkmux_errors::ErrorKind;

use crate::models::{ConnectivityStatus, TaskProfile, UserContext};

/// Callbacks from the transport core into the application.
pub trait TransportListener: Send + Sync {
    /// Fired exactly once per accepted task.
    fn on_task_end(
        &self,
        task_id: u32,
        user_context: Option<&UserContext>,
        kind: ErrorKind,
        code: i32,
    );

    fn on_push(&self, _cmd_id: u32, _task_id: u32, _body: &[u8], _ext: &[u8]) {}

    fn on_connectivity(&self, _overall: ConnectivityStatus, _long_link: ConnectivityStatus) {}

    fn on_long_link_network_error(
        &self,
        _kind: ErrorKind,
        _code: i32,
        _ip: &str,
        _host: &str,
        _port: u16,
    ) {
    }

    fn on_short_link_network_error(
        &self,
        _kind: ErrorKind,
        _code: i32,
        _ip: &str,
        _host: &str,
        _port: u16,
    ) {
    }

    fn on_task_profile(&self, _profile: &TaskProfile) {}
}
