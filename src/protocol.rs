//! Line-delimited JSON protocol spoken between the host and a worker.
//!
//! Every request carries an `id` which the worker echoes verbatim in its reply:
//!
//! ```text
//! -> {"id":"…","type":"init","indexURL":"/usr"}
//! -> {"id":"…","type":"runCode","code":"print('hi')"}
//! <- {"id":"…","ok":true,"exitCode":0,"stdout":"hi\n","stderr":""}
//! ```
//!
//! Both directions go through exactly one validating decode step
//! ([`IncomingRequest::decode`] in the worker, [`decode_reply`] on the host);
//! nothing past that step sees untyped JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PyletError, Result};

/// Requests understood by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    #[serde(rename = "init")]
    Init {
        #[serde(rename = "indexURL", skip_serializing_if = "Option::is_none")]
        index_url: Option<String>,
    },
    #[serde(rename = "runCode")]
    RunCode { code: String },
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a str,
    #[serde(flatten)]
    request: &'a WorkerRequest,
}

/// Serialize a request with its correlation id as a single JSON line (no newline).
pub fn encode_request(id: &str, request: &WorkerRequest) -> Result<String> {
    Ok(serde_json::to_string(&Envelope { id, request })?)
}

/// A request that passed validation inside the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub id: Value,
    pub request: WorkerRequest,
}

/// A request the worker refuses, with whatever id could be recovered.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRequest {
    pub id: Value,
    pub message: String,
}

impl IncomingRequest {
    pub fn decode(line: &str) -> std::result::Result<Self, RejectedRequest> {
        let value: Value = serde_json::from_str(line.trim()).map_err(|e| RejectedRequest {
            id: Value::Null,
            message: format!("Invalid request: {}", e),
        })?;

        let Value::Object(fields) = value else {
            return Err(RejectedRequest {
                id: Value::Null,
                message: "Invalid request: expected a JSON object".to_string(),
            });
        };

        let id = fields.get("id").cloned().unwrap_or(Value::Null);
        let reject = |message: String| RejectedRequest {
            id: id.clone(),
            message,
        };

        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            _ => return Err(reject("Invalid request: missing message type".to_string())),
        };

        let request = match kind {
            "init" => {
                let index_url = match fields.get("indexURL") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(url)) => Some(url.clone()),
                    Some(_) => {
                        return Err(reject(
                            "Invalid request: indexURL must be a string".to_string(),
                        ))
                    }
                };
                WorkerRequest::Init { index_url }
            }
            "runCode" => match fields.get("code") {
                Some(Value::String(code)) => WorkerRequest::RunCode { code: code.clone() },
                _ => {
                    return Err(reject(
                        "Invalid request: runCode requires a string code".to_string(),
                    ))
                }
            },
            other => return Err(reject(format!("Unknown message type: {}", other))),
        };

        Ok(Self { id, request })
    }
}

/// Typed outcome of one worker request.
///
/// `ok` holds exactly when `exit_code` is 0. `error` is only set when the
/// interpreter could not be reached at all (load failure, dead interpreter,
/// malformed reply).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionReport {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn completed(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            ok: exit_code == 0,
            exit_code,
            stdout,
            stderr,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Reply as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default)]
    pub id: Value,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireResponse {
    pub fn from_report(id: Value, report: ExecutionReport) -> Self {
        Self {
            id,
            ok: report.ok,
            exit_code: Some(report.exit_code),
            stdout: Some(report.stdout),
            stderr: Some(report.stderr),
            error: report.error,
        }
    }

    pub fn rejected(rejection: RejectedRequest) -> Self {
        Self {
            id: rejection.id,
            ok: false,
            exit_code: Some(1),
            stdout: None,
            stderr: None,
            error: Some(rejection.message),
        }
    }

    /// Normalize into a report: a missing exit code follows `ok`, and a
    /// failure never carries exit code 0.
    pub fn into_report(self) -> ExecutionReport {
        let exit_code = match (self.ok, self.exit_code) {
            (_, Some(code)) => code,
            (true, None) => 0,
            (false, None) => 1,
        };
        let exit_code = if !self.ok && exit_code == 0 {
            1
        } else {
            exit_code
        };

        ExecutionReport {
            ok: exit_code == 0,
            exit_code,
            stdout: self.stdout.unwrap_or_default(),
            stderr: self.stderr.unwrap_or_default(),
            error: self.error,
        }
    }
}

/// Decode one reply line into its correlation id and report.
///
/// Fails only when no string id can be recovered; a reply with a usable id
/// but an invalid body still resolves its caller, as a failed report.
pub fn decode_reply(line: &str) -> Result<(String, ExecutionReport)> {
    let value: Value = serde_json::from_str(line.trim())?;

    let id = match value.get("id") {
        Some(Value::String(id)) => id.clone(),
        _ => {
            return Err(PyletError::Protocol(
                "Worker reply has no string id".to_string(),
            ))
        }
    };

    match serde_json::from_value::<WireResponse>(value) {
        Ok(response) => Ok((id, response.into_report())),
        Err(e) => Ok((
            id,
            ExecutionReport::failed(format!("Malformed worker reply: {}", e)),
        )),
    }
}
