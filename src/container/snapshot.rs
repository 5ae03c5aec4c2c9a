//! Tolerant decoding of runtime inspect output.
//!
//! Runtimes disagree on the shape of `inspect` JSON and change it between
//! releases. Only a handful of fields are picked out; everything else is kept
//! in [`ContainerSnapshot::unrecognized`] instead of failing the decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Coarse container status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Unknown(String),
}

impl ContainerStatus {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" | "restarting" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "stopped" | "exited" | "dead" => ContainerStatus::Stopped,
            _ => ContainerStatus::Unknown(raw.to_string()),
        }
    }
}

/// What the runtime reports about one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: Option<String>,
    pub status: ContainerStatus,
    pub image: Option<String>,
    /// Top-level fields that were not interpreted.
    pub unrecognized: BTreeMap<String, Value>,
}

impl ContainerSnapshot {
    /// Decodes `inspect` output, which may be an object or an array of them.
    pub fn parse_all(text: &str) -> Result<Vec<Self>> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) => items.into_iter().map(Self::from_value).collect(),
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    /// Decodes a single container object.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(Error::Runtime {
                    operation: "inspect",
                    message: format!("expected a JSON object, got {}", other),
                    guidance: None,
                })
            }
        };

        let configuration = fields.get("configuration").cloned();

        let id = take_string(&mut fields, &["id", "Id", "ID"]).or_else(|| {
            configuration
                .as_ref()
                .and_then(|c| c.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let status = status_of(&mut fields);

        let image = docker_image(&fields).or_else(|| {
            configuration
                .as_ref()
                .and_then(|c| c.pointer("/image/reference"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        Ok(Self {
            id,
            status,
            image,
            unrecognized: fields.into_iter().collect(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

fn take_string(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = fields.get(*key) {
            let s = s.clone();
            fields.remove(*key);
            return Some(s);
        }
    }
    None
}

fn status_of(fields: &mut Map<String, Value>) -> ContainerStatus {
    // apple/container: "status": "running"
    if let Some(raw) = take_string(fields, &["status", "Status"]) {
        return ContainerStatus::parse(&raw);
    }
    // docker/podman: "State": {"Status": "running", "Running": true}
    if let Some(state) = fields.get("State").and_then(Value::as_object) {
        let parsed = match state.get("Status").and_then(Value::as_str) {
            Some(raw) => Some(ContainerStatus::parse(raw)),
            None => state.get("Running").and_then(Value::as_bool).map(|running| {
                if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                }
            }),
        };
        if let Some(status) = parsed {
            fields.remove("State");
            return status;
        }
    }
    ContainerStatus::Unknown(String::new())
}

fn docker_image(fields: &Map<String, Value>) -> Option<String> {
    fields
        .get("Config")
        .and_then(|c| c.get("Image"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
