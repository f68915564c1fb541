//! Network-Port configuration and property mirror
//!
//! The secure-connect datalink is configured through the BACnet
//! Network-Port object (§135 Annex, SC properties). At startup the device
//! assembles a [`NetworkPortConfig`] snapshot — certificate blobs, the
//! persistent device UUID, hub URIs, timers and role enables — and the
//! datalink never reads the object again.
//!
//! In the other direction, every maintenance tick copies the live
//! telemetry into a [`NetworkPortStorage`] mirror, from which the property
//! values (`SC_Primary_Hub_Connection_Status`,
//! `SC_Hub_Function_Connection_Status`, `SC_Direct_Connect_Connection_Status`,
//! `SC_Failed_Connection_Requests`, `SC_Hub_Connector_State`) can be read
//! and encoded per Clause 21.

use std::time::Duration;

use crate::bvlc::HubConnectorState;
use crate::node::{NodeConfig, ScNode};
use crate::telemetry::{
    self, DirectConnectionStatus, FailedConnectionRequest, HubConnectionStatus,
    HubFunctionConnectionStatus,
};
use crate::util::{DeviceUuid, VmacAddress};
use crate::websocket::TlsCredentials;

/// Network binding of an acceptor role: TCP port plus optional interface
/// name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Binding {
    pub port: u16,
    pub iface: Option<String>,
}

/// Startup configuration snapshot of the SC Network-Port object.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkPortConfig {
    /// Issuer certificates (`Issuer_Certificate_File[0..M-1]`), PEM blobs.
    pub issuer_certificates: Vec<Vec<u8>>,
    /// `Operational_Certificate_File` contents, PEM.
    pub operational_certificate: Vec<u8>,
    /// `Certificate_Signing_Request_File` contents; exposed as a property
    /// but not consumed by the runtime.
    pub certificate_signing_request: Vec<u8>,
    /// `Certificate_Key_File` contents, PEM.
    pub certificate_key: Vec<u8>,
    /// `Local_UUID`; persistent across restarts.
    pub local_uuid: DeviceUuid,
    /// `Local_VMAC`; `None` generates a Random-48 VMAC at init.
    pub local_vmac: Option<VmacAddress>,
    pub max_bvlc_length_accepted: u16,
    pub max_npdu_length_accepted: u16,
    pub primary_hub_uri: String,
    pub failover_hub_uri: String,
    /// `SC_Connect_Wait_Timeout`; AB.6.2 recommends 10 seconds.
    pub connect_wait_timeout: Duration,
    /// `SC_Heartbeat_Timeout`; 12.56.Y10 recommends 300 seconds.
    pub heartbeat_timeout: Duration,
    /// `SC_Disconnect_Wait_Timeout`.
    pub disconnect_wait_timeout: Duration,
    /// `SC_Maximum_Reconnect_Time`.
    pub maximum_reconnect_time: Duration,
    /// Defaults to the connect wait timeout when unset.
    pub address_resolution_timeout: Option<Duration>,
    /// Defaults to the connect wait timeout when unset.
    pub address_resolution_freshness_timeout: Option<Duration>,
    /// `SC_Hub_Function_Enable` plus its binding.
    pub hub_function_enabled: bool,
    pub hub_function_binding: Binding,
    /// `SC_Direct_Connect_Initiate_Enable`.
    pub direct_connect_initiate_enabled: bool,
    /// `SC_Direct_Connect_Accept_Enable` plus binding and advertised URIs.
    pub direct_connect_accept_enabled: bool,
    pub direct_connect_binding: Binding,
    pub direct_connect_accept_uris: Vec<String>,
}

impl Default for NetworkPortConfig {
    fn default() -> Self {
        NetworkPortConfig {
            issuer_certificates: Vec::new(),
            operational_certificate: Vec::new(),
            certificate_signing_request: Vec::new(),
            certificate_key: Vec::new(),
            local_uuid: DeviceUuid::default(),
            local_vmac: None,
            max_bvlc_length_accepted: crate::BVLC_SC_NPDU_SIZE as u16 + 36,
            max_npdu_length_accepted: crate::BVLC_SC_NPDU_SIZE as u16,
            primary_hub_uri: String::new(),
            failover_hub_uri: String::new(),
            connect_wait_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(300),
            disconnect_wait_timeout: Duration::from_secs(10),
            maximum_reconnect_time: Duration::from_secs(30),
            address_resolution_timeout: None,
            address_resolution_freshness_timeout: None,
            hub_function_enabled: false,
            hub_function_binding: Binding {
                port: 4443,
                iface: None,
            },
            direct_connect_initiate_enabled: false,
            direct_connect_accept_enabled: false,
            direct_connect_binding: Binding {
                port: 4444,
                iface: None,
            },
            direct_connect_accept_uris: Vec::new(),
        }
    }
}

impl NetworkPortConfig {
    /// Assemble the node configuration. Generates a Random-48 VMAC when
    /// `local_vmac` is unset.
    pub fn to_node_config(&self) -> NodeConfig {
        let mut ca_chain = Vec::new();
        for cert in &self.issuer_certificates {
            ca_chain.extend_from_slice(cert);
            if !cert.ends_with(b"\n") {
                ca_chain.push(b'\n');
            }
        }
        NodeConfig {
            credentials: TlsCredentials {
                ca_chain,
                cert_chain: self.operational_certificate.clone(),
                private_key: self.certificate_key.clone(),
            },
            local_vmac: self.local_vmac.unwrap_or_else(VmacAddress::random),
            local_uuid: self.local_uuid,
            max_bvlc_len: self.max_bvlc_length_accepted,
            max_npdu_len: self.max_npdu_length_accepted,
            connect_timeout: self.connect_wait_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
            disconnect_timeout: self.disconnect_wait_timeout,
            reconnect_timeout: self.maximum_reconnect_time,
            address_resolution_timeout: self
                .address_resolution_timeout
                .unwrap_or(self.connect_wait_timeout),
            address_resolution_freshness: self
                .address_resolution_freshness_timeout
                .unwrap_or(self.connect_wait_timeout),
            primary_hub_uri: self.primary_hub_uri.clone(),
            failover_hub_uri: self.failover_hub_uri.clone(),
            iface: self.hub_function_binding.iface.clone(),
            hub_function_enabled: self.hub_function_enabled,
            hub_function_port: self.hub_function_binding.port,
            direct_connect_initiate_enabled: self.direct_connect_initiate_enabled,
            direct_connect_accept_enabled: self.direct_connect_accept_enabled,
            direct_connect_port: self.direct_connect_binding.port,
            direct_connect_accept_uris: self.direct_connect_accept_uris.clone(),
        }
    }
}

/// Mirror of the SC status properties, refreshed by the maintenance tick.
#[derive(Debug, Clone)]
pub struct NetworkPortStorage {
    pub hub_connector_state: HubConnectorState,
    pub primary_hub_connection_status: HubConnectionStatus,
    pub failover_hub_connection_status: HubConnectionStatus,
    pub hub_function_connection_status: Vec<HubFunctionConnectionStatus>,
    pub direct_connection_status: Vec<DirectConnectionStatus>,
    pub failed_connection_requests: Vec<FailedConnectionRequest>,
}

impl Default for NetworkPortStorage {
    fn default() -> Self {
        NetworkPortStorage {
            hub_connector_state: HubConnectorState::NoHubConnection,
            primary_hub_connection_status: HubConnectionStatus::default(),
            failover_hub_connection_status: HubConnectionStatus::default(),
            hub_function_connection_status: Vec::new(),
            direct_connection_status: Vec::new(),
            failed_connection_requests: Vec::new(),
        }
    }
}

impl NetworkPortStorage {
    /// Copy the current telemetry out of the node.
    pub fn update_from(&mut self, node: &ScNode) {
        self.hub_connector_state = node.hub_connector_state();
        if let Some(status) = node.hub_status(true) {
            self.primary_hub_connection_status = status.clone();
        }
        if let Some(status) = node.hub_status(false) {
            self.failover_hub_connection_status = status.clone();
        }
        self.hub_function_connection_status = node
            .hub_function()
            .map(|hf| hf.status_list().cloned().collect())
            .unwrap_or_default();
        self.direct_connection_status = node
            .node_switch()
            .map(|ns| ns.status_list().cloned().collect())
            .unwrap_or_default();
        self.failed_connection_requests = node.failed_requests().cloned().collect();
    }

    /// Encode `SC_Primary_Hub_Connection_Status` or the failover variant.
    pub fn encode_hub_connection_status(&self, primary: bool) -> telemetry::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let status = if primary {
            &self.primary_hub_connection_status
        } else {
            &self.failover_hub_connection_status
        };
        telemetry::encode_sc_hub_connection(&mut buffer, status)?;
        Ok(buffer)
    }

    /// Encode the `SC_Hub_Function_Connection_Status` list.
    pub fn encode_hub_function_connection_status(&self) -> telemetry::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for status in &self.hub_function_connection_status {
            telemetry::encode_sc_hub_function_connection(&mut buffer, status)?;
        }
        Ok(buffer)
    }

    /// Encode the `SC_Direct_Connect_Connection_Status` list.
    pub fn encode_direct_connection_status(&self) -> telemetry::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for status in &self.direct_connection_status {
            telemetry::encode_sc_direct_connection(&mut buffer, status)?;
        }
        Ok(buffer)
    }

    /// Encode the `SC_Failed_Connection_Requests` list.
    pub fn encode_failed_connection_requests(&self) -> telemetry::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for record in &self.failed_connection_requests {
            telemetry::encode_sc_failed_connection_request(&mut buffer, record)?;
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timers() {
        let config = NetworkPortConfig::default();
        assert_eq!(config.connect_wait_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        let node_config = config.to_node_config();
        // the resolution timers default to the connect wait
        assert_eq!(node_config.address_resolution_timeout, Duration::from_secs(10));
        assert_eq!(node_config.address_resolution_freshness, Duration::from_secs(10));
    }

    #[test]
    fn test_random_vmac_when_unset() {
        let config = NetworkPortConfig::default();
        let a = config.to_node_config().local_vmac;
        let b = config.to_node_config().local_vmac;
        assert!(!a.is_unspecified());
        // two draws colliding would mean the generator is broken
        assert_ne!(a, b);
    }

    #[test]
    fn test_issuer_chain_concatenation() {
        let mut config = NetworkPortConfig::default();
        config.issuer_certificates = vec![b"CERT-A".to_vec(), b"CERT-B\n".to_vec()];
        let creds = config.to_node_config().credentials;
        assert_eq!(creds.ca_chain, b"CERT-A\nCERT-B\n");
    }

    #[test]
    fn test_storage_encodes_empty_lists() {
        let storage = NetworkPortStorage::default();
        assert!(storage.encode_hub_function_connection_status().unwrap().is_empty());
        assert!(!storage.encode_hub_connection_status(true).unwrap().is_empty());
    }
}
