//! Service discovery document.
//!
//! The tenant publishes every REST resource as a service definition keyed by
//! a fixed GUID. Requests name the GUID and the relative path template is
//! looked up here.

use serde::{Deserialize, Serialize};

/// One REST resource published by the tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceDefinition {
    pub service_type: String,
    pub identifier: String,
    pub display_name: String,
    pub relative_to_setting: i32,
    pub relative_path: String,
    pub description: String,
    pub service_owner: String,
    pub resource_version: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationServiceData {
    pub service_definitions: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionData {
    pub location_service_data: LocationServiceData,
}

impl ConnectionData {
    /// Find a service definition by its identifier (case-insensitive GUID).
    pub fn service_definition(&self, id: &str) -> Option<&ServiceDefinition> {
        self.location_service_data
            .service_definitions
            .iter()
            .find(|d| d.identifier.eq_ignore_ascii_case(id))
    }
}

/// Well-known service identifiers and the api versions they are called with.
pub mod services {
    pub const SESSIONS: &str = "134e239e-2df3-4794-a6f6-24f1f19ec8dc";
    pub const MESSAGES: &str = "c3a054f6-7a8a-49c0-944e-3a8e5d7adfd7";
    pub const TIMELINE: &str = "8893bc5b-35b2-4be7-83cb-99e683551db4";
    pub const LOGS: &str = "46f5667d-263a-4684-91b1-dff7fdcf64e2";
    pub const FEED_LINES: &str = "858983e4-19bd-4c5e-864c-507b59b58b12";
    pub const FINISH_JOB: &str = "557624af-b29e-4c20-8ab0-0399d2204f3f";
    pub const RENEW_JOB: &str = "fc825784-c92a-4299-9221-998a02d1b54f";

    pub const API_5_1: &str = "5.1-preview";
    pub const API_FINISH_JOB: &str = "2.0-preview.1";
}
