// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The serde side of the configuration format.
//!
//! Field names mirror the programmatic insert arguments. Leaving a route
//! field out makes it a wildcard; the loader sets the matching wildcard
//! flag and leaves the field zero, as the engine's insert contract
//! requires.

use crate::LoadError;
use flowgate_core::{
    action::ActionType,
    inet::{AddressFamily, Endpoint, Protocol},
    route::RouteFlags,
    Config, Error,
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Document {
    #[serde(rename = "actions-insert", default)]
    pub actions: Vec<ActionRecord>,
    #[serde(rename = "events-insert", default)]
    pub events: Vec<EventRecord>,
    #[serde(rename = "static-routes-insert", default)]
    pub routes: Vec<RouteRecord>,
    #[serde(rename = "default-policies", default)]
    pub default_policies: Option<DefaultPolicies>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ActionRecord {
    pub label: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EventRecord {
    pub label: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub config: Option<ConfigRecord>,
    #[serde(rename = "on-insert", default)]
    pub on_insert: Vec<String>,
    #[serde(rename = "on-match", default)]
    pub on_match: Vec<String>,
    #[serde(rename = "on-update", default)]
    pub on_update: Vec<String>,
    #[serde(rename = "on-delete", default)]
    pub on_delete: Vec<String>,
    #[serde(rename = "on-decision", default)]
    pub on_decision: Vec<String>,
}

impl EventRecord {
    pub fn chains(&self) -> [(ActionType, &[String]); 5] {
        [
            (ActionType::Insert, self.on_insert.as_slice()),
            (ActionType::Match, self.on_match.as_slice()),
            (ActionType::Update, self.on_update.as_slice()),
            (ActionType::Delete, self.on_delete.as_slice()),
            (ActionType::Decision, self.on_decision.as_slice()),
        ]
    }
}

/// Per-event overrides; unset fields inherit the context configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigRecord {
    #[serde(rename = "route-private-data-size", default)]
    pub route_private_data_size: Option<usize>,
    #[serde(rename = "route-private-data-alignment", default)]
    pub route_private_data_alignment: Option<usize>,
    #[serde(rename = "max-connection-count", default)]
    pub max_connection_count: Option<u32>,
}

impl ConfigRecord {
    pub fn resolve(&self, defaults: &Config) -> Config {
        Config {
            route_private_data_size: self
                .route_private_data_size
                .unwrap_or(defaults.route_private_data_size),
            route_private_data_alignment: self
                .route_private_data_alignment
                .unwrap_or(defaults.route_private_data_alignment),
            max_connection_count: self
                .max_connection_count
                .unwrap_or(defaults.max_connection_count),
        }
    }
}

/// Accepts either protocol-name strings or raw numbers, so numeric
/// configurations work on hosts without name tables.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum NameOrNumber {
    Number(u16),
    Name(String),
}

impl NameOrNumber {
    fn family(&self) -> Result<AddressFamily, LoadError> {
        match self {
            Self::Number(raw) => Ok(AddressFamily::new(*raw)),
            Self::Name(name) => match name.as_str() {
                "inet" | "ipv4" => Ok(AddressFamily::INET),
                "inet6" | "ipv6" => Ok(AddressFamily::INET6),
                other => Err(LoadError::new(
                    Error::InvalidArg,
                    format!("unknown address family {other:?}"),
                )),
            },
        }
    }

    fn protocol(&self) -> Result<Protocol, LoadError> {
        match self {
            Self::Number(raw) => Ok(Protocol::new(*raw)),
            Self::Name(name) => match name.as_str() {
                "tcp" => Ok(Protocol::TCP),
                "udp" => Ok(Protocol::UDP),
                "icmp" => Ok(Protocol::ICMP),
                other => Err(LoadError::new(
                    Error::InvalidArg,
                    format!("unknown protocol {other:?}"),
                )),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EndpointRecord {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(rename = "prefix-bits", default)]
    pub prefix_bits: Option<u8>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub interface: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RouteRecord {
    #[serde(rename = "parent-event", default)]
    pub parent_event: Option<String>,
    #[serde(default)]
    pub family: Option<NameOrNumber>,
    #[serde(default)]
    pub protocol: Option<NameOrNumber>,
    #[serde(rename = "direction-in", default)]
    pub direction_in: bool,
    #[serde(rename = "direction-out", default)]
    pub direction_out: bool,
    #[serde(rename = "green-listed", default)]
    pub green_listed: bool,
    #[serde(rename = "penalty-boxed", default)]
    pub penalty_boxed: bool,
    #[serde(rename = "tcplike-port-numbers", default)]
    pub tcplike_port_numbers: bool,
    pub remote: EndpointRecord,
    pub local: EndpointRecord,
}

impl RouteRecord {
    pub fn resolve(&self) -> Result<(Endpoint, Endpoint, RouteFlags), LoadError> {
        let mut flags = RouteFlags::NONE;
        if self.direction_in {
            flags |= RouteFlags::DIRECTION_IN;
        }
        if self.direction_out {
            flags |= RouteFlags::DIRECTION_OUT;
        }
        if flags.direction().is_empty() {
            return Err(LoadError::new(
                Error::InvalidArg,
                "route needs direction-in, direction-out, or both",
            ));
        }
        if self.green_listed {
            flags |= RouteFlags::GREENLISTED;
        }
        if self.penalty_boxed {
            flags |= RouteFlags::PENALTYBOXED;
        }
        if self.tcplike_port_numbers {
            flags |= RouteFlags::TCPLIKE_PORT_NUMBERS;
        }

        let family = match &self.family {
            Some(family) => family.family()?,
            None => {
                flags |= RouteFlags::FAMILY_WILDCARD;
                AddressFamily::UNSPEC
            }
        };
        let proto = match &self.protocol {
            Some(protocol) => protocol.protocol()?,
            None => {
                flags |= RouteFlags::PROTO_WILDCARD;
                Protocol::UNSPEC
            }
        };

        let remote = resolve_endpoint(
            &self.remote,
            family,
            proto,
            &mut flags,
            RouteFlags::REMOTE_ADDR_WILDCARD,
            RouteFlags::REMOTE_PORT_WILDCARD,
            RouteFlags::REMOTE_INTERFACE_WILDCARD,
        )?;
        let local = resolve_endpoint(
            &self.local,
            family,
            proto,
            &mut flags,
            RouteFlags::LOCAL_ADDR_WILDCARD,
            RouteFlags::LOCAL_PORT_WILDCARD,
            RouteFlags::LOCAL_INTERFACE_WILDCARD,
        )?;
        Ok((remote, local, flags))
    }
}

fn resolve_endpoint(
    record: &EndpointRecord,
    family: AddressFamily,
    proto: Protocol,
    flags: &mut RouteFlags,
    addr_wildcard: RouteFlags,
    port_wildcard: RouteFlags,
    iface_wildcard: RouteFlags,
) -> Result<Endpoint, LoadError> {
    let port = match record.port {
        Some(port) => port,
        None => {
            flags.insert(port_wildcard);
            0
        }
    };
    let interface = match record.interface {
        Some(interface) => interface,
        None => {
            flags.insert(iface_wildcard);
            0
        }
    };

    let (bytes, bits): (Vec<u8>, u8) = match &record.address {
        None => {
            flags.insert(addr_wildcard);
            (Vec::new(), 0)
        }
        Some(_) if family.is_unspecified() => {
            return Err(LoadError::new(
                Error::InvalidArg,
                "an address needs an address family",
            ));
        }
        Some(text) => {
            let ip: std::net::IpAddr = text.parse().map_err(|_| {
                LoadError::new(Error::InvalidArg, format!("bad address {text:?}"))
            })?;
            let bytes = match ip {
                std::net::IpAddr::V4(ip) => {
                    if family != AddressFamily::INET {
                        return Err(LoadError::new(
                            Error::InvalidArg,
                            format!("{text:?} does not fit the declared family"),
                        ));
                    }
                    ip.octets().to_vec()
                }
                std::net::IpAddr::V6(ip) => {
                    if family != AddressFamily::INET6 {
                        return Err(LoadError::new(
                            Error::InvalidArg,
                            format!("{text:?} does not fit the declared family"),
                        ));
                    }
                    ip.octets().to_vec()
                }
            };
            let full = (bytes.len() * 8) as u8;
            let bits = record.prefix_bits.unwrap_or(full);
            if bits > full {
                return Err(LoadError::new(
                    Error::InvalidArg,
                    format!("prefix-bits {bits} exceeds the address width"),
                ));
            }
            (bytes, bits)
        }
    };

    Endpoint::new(family, proto, &bytes, bits, port, interface)
        .map_err(|err| LoadError::new(err, "endpoint out of range"))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DefaultPolicies {
    #[serde(rename = "static-routes", default)]
    pub static_routes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_record_wildcards_follow_omissions() {
        let json = r#"{
            "family": "inet",
            "protocol": "tcp",
            "direction-in": true,
            "remote": { "address": "127.0.0.0", "prefix-bits": 8, "port": 12345 },
            "local": { "interface": 1 }
        }"#;
        let record: RouteRecord = serde_json::from_str(json).unwrap();
        let (remote, local, flags) = record.resolve().unwrap();

        assert_eq!(remote.addr_bits(), 8);
        assert_eq!(remote.port, 12345);
        assert!(flags.contains(RouteFlags::REMOTE_INTERFACE_WILDCARD));
        assert!(flags.contains(RouteFlags::LOCAL_ADDR_WILDCARD));
        assert!(flags.contains(RouteFlags::LOCAL_PORT_WILDCARD));
        assert!(!flags.contains(RouteFlags::LOCAL_INTERFACE_WILDCARD));
        assert_eq!(local.interface, 1);
        assert_eq!(local.addr_bits(), 0);
    }

    #[test]
    fn numeric_family_and_protocol() {
        let json = r#"{
            "family": 2,
            "protocol": 6,
            "direction-out": true,
            "remote": { "address": "192.0.2.1" },
            "local": {}
        }"#;
        let record: RouteRecord = serde_json::from_str(json).unwrap();
        let (remote, _, flags) = record.resolve().unwrap();
        assert_eq!(remote.family, AddressFamily::INET);
        assert_eq!(remote.proto, Protocol::TCP);
        assert_eq!(remote.addr_bits(), 32);
        assert!(flags.contains(RouteFlags::DIRECTION_OUT));
    }

    #[test]
    fn directionless_routes_are_rejected() {
        let json = r#"{ "remote": {}, "local": {} }"#;
        let record: RouteRecord = serde_json::from_str(json).unwrap();
        assert!(record.resolve().is_err());
    }

    #[test]
    fn family_mismatch_is_rejected() {
        let json = r#"{
            "family": "inet6",
            "direction-in": true,
            "remote": { "address": "192.0.2.1" },
            "local": {}
        }"#;
        let record: RouteRecord = serde_json::from_str(json).unwrap();
        assert!(record.resolve().is_err());
    }
}
