//! Command Bridge
//!
//! Request/response surface for a host UI. One request per line:
//!
//! ```text
//! → {"method":"connect","args":{"serverAddress":"vpn.example.net","serverPort":443,"connectionName":"office"}}
//! ← {"ok":true,"result":true}
//! → {"method":"getStats"}
//! ← {"ok":true,"result":{"packetsTotal":12,"dnsResponses":3,"tunnelActive":true,...}}
//! → {"method":"reboot"}
//! ← {"ok":false,"error":{"code":"not_implemented","message":"unknown method reboot"}}
//! ```

use crate::client::TunnelClient;
use crate::config::ConnectRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Error code for missing or malformed `connect` arguments
pub const INVALID_ARGS: &str = "invalid_args";
/// Error code for an unknown method
pub const NOT_IMPLEMENTED: &str = "not_implemented";
/// Error code for a line that is not a request object
pub const INVALID_REQUEST: &str = "invalid_request";

/// Wire envelope before the method is resolved
#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    args: Value,
}

/// A resolved bridge command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Initialize,
    Prepare,
    Connect(ConnectRequest),
    Disconnect,
    IsConnected,
    GetStats,
    GetState,
}

impl Command {
    /// Resolve a method name and its arguments
    pub fn from_method(method: &str, args: Value) -> Result<Self, Response> {
        let command = match method {
            "initialize" => Command::Initialize,
            "prepare" => Command::Prepare,
            "connect" => {
                let args = match args {
                    Value::Null => Value::Object(Default::default()),
                    // some hosts send the argument map pre-encoded
                    Value::String(encoded) => serde_json::from_str(&encoded)
                        .map_err(|e| Response::failure(INVALID_ARGS, e.to_string()))?,
                    args => args,
                };
                let request = serde_json::from_value(args)
                    .map_err(|e| Response::failure(INVALID_ARGS, e.to_string()))?;
                Command::Connect(request)
            }
            "disconnect" => Command::Disconnect,
            "isConnected" => Command::IsConnected,
            "getStats" => Command::GetStats,
            "getState" => Command::GetState,
            other => {
                return Err(Response::failure(
                    NOT_IMPLEMENTED,
                    format!("unknown method {}", other),
                ));
            }
        };
        Ok(command)
    }

    /// Parse one request line
    pub fn parse(line: &str) -> Result<Self, Response> {
        let request: Request = serde_json::from_str(line)
            .map_err(|e| Response::failure(INVALID_REQUEST, e.to_string()))?;
        Self::from_method(&request.method, request.args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self::failure("io_error", e.to_string()),
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Serialize as a single JSON line (no trailing newline)
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"ok":false,"error":{{"code":"io_error","message":"{}"}}}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}

/// Run one command against the client
pub async fn execute(client: &TunnelClient, command: Command) -> Response {
    debug!("Bridge command: {:?}", command);

    match command {
        Command::Initialize => Response::success(client.initialize()),
        Command::Prepare => Response::success(client.prepare().await),
        Command::Connect(request) => match client.connect(request).await {
            Ok(accepted) => Response::success(accepted),
            Err(e) if e.is_config() => Response::failure(INVALID_ARGS, e.to_string()),
            Err(e) => Response::failure(e.code(), e.to_string()),
        },
        Command::Disconnect => Response::success(client.disconnect().await),
        Command::IsConnected => Response::success(client.is_connected()),
        Command::GetStats => Response::success(client.get_stats()),
        Command::GetState => Response::success(client.state()),
    }
}

/// Handle one request line, returning the response
pub async fn handle_line(client: &TunnelClient, line: &str) -> Response {
    match Command::parse(line) {
        Ok(command) => execute(client, command).await,
        Err(response) => response,
    }
}
