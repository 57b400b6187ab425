//! `${local-address}` / `${local-port}` expansion for command lines and URLs
//! that should point at a forwarder's listener.

use std::net::IpAddr;

pub const LOCAL_ADDRESS_PLACEHOLDER: &str = "${local-address}";
pub const LOCAL_PORT_PLACEHOLDER: &str = "${local-port}";

/// Replace every local endpoint placeholder in `template`
pub fn expand_local_endpoint(template: &str, address: IpAddr, port: u16) -> String {
    template
        .replace(LOCAL_ADDRESS_PLACEHOLDER, &address.to_string())
        .replace(LOCAL_PORT_PLACEHOLDER, &port.to_string())
}

pub fn has_placeholders(template: &str) -> bool {
    template.contains(LOCAL_ADDRESS_PLACEHOLDER) || template.contains(LOCAL_PORT_PLACEHOLDER)
}
