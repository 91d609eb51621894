//! Topic naming.
//!
//! Every topic is prefixed by an opaque `<scope>`; the scope is never
//! parsed, only prepended. Defined suffix families:
//!
//! | Topic | Direction |
//! |---|---|
//! | `<scope>__CMDINTERFACE__<interface>` | lifecycle input |
//! | `<scope>__COMMAND__<target>__<packet>` | raw command echo |
//! | `<scope>__DECOMCMD__<target>__<packet>` | decommutated command |
//! | `<scope>__TELEMETRY__<target>__<packet>` | telemetry output |

use commlink_types::CommError;

/// Topic-name fragment that marks a lifecycle message for an interface.
pub const CMD_INTERFACE: &str = "CMDINTERFACE";

pub fn cmd_interface(scope: &str, interface_name: &str) -> String {
    format!("{scope}__{CMD_INTERFACE}__{interface_name}")
}

pub fn command(scope: &str, target: &str, packet: &str) -> String {
    format!("{scope}__COMMAND__{target}__{packet}")
}

pub fn decom_command(scope: &str, target: &str, packet: &str) -> String {
    format!("{scope}__DECOMCMD__{target}__{packet}")
}

pub fn telemetry(scope: &str, target: &str, packet: &str) -> String {
    format!("{scope}__TELEMETRY__{target}__{packet}")
}

/// Extract the interface name from a microservice identity of the form
/// `<scope>__<kind>__<interface_name>`.
pub fn interface_name_from(microservice_name: &str) -> Result<&str, CommError> {
    microservice_name.split("__").nth(2).ok_or_else(|| {
        CommError::Store(format!(
            "malformed microservice name '{microservice_name}' (expected <scope>__<kind>__<interface>)"
        ))
    })
}

/// Extract the scope prefix from the same identity form.
pub fn scope_from(microservice_name: &str) -> Result<&str, CommError> {
    let mut parts = microservice_name.split("__");
    let scope = parts.next().unwrap_or_default();
    if scope.is_empty() || parts.next().is_none() {
        return Err(CommError::Store(format!(
            "malformed microservice name '{microservice_name}' (expected <scope>__<kind>__<interface>)"
        )));
    }
    Ok(scope)
}
