//! Network Protocol Definitions
//!
//! Messages exchanged between nodes to fetch module code and to announce undeploys.
//! Both travel on [`TOPIC_MODULE_FETCH`]; fetch answers come back on the private
//! response topic named in the request.

use super::types::ContextId;

use serde::{Deserialize, Serialize};

pub const TOPIC_MODULE_FETCH: &str = "MODULE_FETCH";
pub const RESPONSE_TOPIC_PREFIX: &str = "MODULE_FETCH/response/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleRequest {
    /// Context on the receiving node that should serve the resource.
    pub loader_id: Option<ContextId>,
    /// Resource path, or the undeployed alias when `is_undeploy` is set.
    pub resource_name: String,
    pub is_undeploy: bool,
    /// Where to send the answer; absent for undeploy notices.
    pub response_topic: Option<String>,
}

impl ModuleRequest {
    pub fn fetch(loader_id: Option<ContextId>, resource_name: &str, response_topic: String) -> Self {
        Self {
            loader_id,
            resource_name: resource_name.to_string(),
            is_undeploy: false,
            response_topic: Some(response_topic),
        }
    }

    pub fn undeploy(alias: &str) -> Self {
        Self {
            loader_id: None,
            resource_name: alias.to_string(),
            is_undeploy: true,
            response_topic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub bytes: Option<Vec<u8>>,
}

impl ModuleResponse {
    pub fn found(bytes: Vec<u8>) -> Self {
        Self {
            success: true,
            error_message: None,
            bytes: Some(bytes),
        }
    }

    pub fn missing(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(error_message.into()),
            bytes: None,
        }
    }
}

/// A topic nobody else will ever listen on.
pub fn new_response_topic() -> String {
    format!("{}{}", RESPONSE_TOPIC_PREFIX, uuid::Uuid::new_v4())
}
