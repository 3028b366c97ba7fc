//! The isolated side of a sandbox.
//!
//! A worker reads newline-delimited requests, handles them strictly one at a
//! time in arrival order, and writes one reply line per request. It runs
//! either as the `pylet-worker` process (stdin/stdout) or as a tokio task
//! behind an in-memory pipe; the loop is the same in both cases.

mod interpreter;
mod runtime;

pub use interpreter::{
    CapturedRun, Interpreter, InterpreterLoader, ProcessInterpreter, ProcessLoader,
    DEFAULT_INDEX_URL,
};
pub use runtime::{PythonRuntime, PROBE_SOURCE};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{IncomingRequest, WireResponse, WorkerRequest};

/// Serve requests until the input ends.
pub async fn serve<R, W>(reader: R, mut writer: W, runtime: PythonRuntime) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("Worker ready");
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&runtime, &line).await;
        let json = serde_json::to_string(&response)?;

        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    info!("Worker input closed, exiting");
    Ok(())
}

/// Decode one request line and produce its reply.
pub async fn handle_line(runtime: &PythonRuntime, line: &str) -> WireResponse {
    let IncomingRequest { id, request } = match IncomingRequest::decode(line) {
        Ok(incoming) => incoming,
        Err(rejected) => {
            warn!(id = %rejected.id, message = %rejected.message, "Rejected request");
            return WireResponse::rejected(rejected);
        }
    };

    let report = match request {
        WorkerRequest::Init { index_url } => {
            debug!(id = %id, index_url = ?index_url, "init");
            runtime.init(index_url).await
        }
        WorkerRequest::RunCode { code } => {
            debug!(id = %id, code_len = code.len(), "runCode");
            runtime.run_code(&code).await
        }
    };

    WireResponse::from_report(id, report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    struct UpperInterpreter;

    #[async_trait]
    impl Interpreter for UpperInterpreter {
        fn version(&self) -> &str {
            "3.upper"
        }

        async fn run(&mut self, source: &str) -> Result<CapturedRun> {
            Ok(CapturedRun {
                exit_code: 0,
                stdout: source.to_uppercase(),
                stderr: String::new(),
            })
        }
    }

    struct UpperLoader;

    #[async_trait]
    impl InterpreterLoader for UpperLoader {
        async fn load_primary(&self, _index_url: &str) -> Result<Box<dyn Interpreter>> {
            Ok(Box::new(UpperInterpreter))
        }

        async fn load_fallback(&self) -> Result<Box<dyn Interpreter>> {
            Ok(Box::new(UpperInterpreter))
        }
    }

    fn runtime() -> PythonRuntime {
        PythonRuntime::new(Arc::new(UpperLoader), DEFAULT_INDEX_URL)
    }

    fn to_value(response: &WireResponse) -> Value {
        serde_json::to_value(response).unwrap()
    }

    #[tokio::test]
    async fn test_init_replies_with_probe() {
        let response = handle_line(&runtime(), r#"{"id": "1", "type": "init"}"#).await;
        let value = to_value(&response);
        assert_eq!(value["id"], "1");
        assert_eq!(value["ok"], true);
        assert_eq!(value["exitCode"], 0);
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_run_code_echoes_id() {
        let response = handle_line(
            &runtime(),
            r#"{"id": 99, "type": "runCode", "code": "print"}"#,
        )
        .await;
        assert_eq!(
            to_value(&response),
            json!({"id": 99, "ok": true, "exitCode": 0, "stdout": "PRINT", "stderr": ""})
        );
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let response = handle_line(&runtime(), r#"{"id": "u", "type": "exec"}"#).await;
        assert_eq!(
            to_value(&response),
            json!({"id": "u", "ok": false, "exitCode": 1, "error": "Unknown message type: exec"})
        );
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let response = handle_line(&runtime(), r#"{"invalid": "json"}"#).await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("Invalid request"));
    }

    #[tokio::test]
    async fn test_serve_answers_in_order() {
        let (host, guest) = tokio::io::duplex(4096);
        let (guest_read, guest_write) = tokio::io::split(guest);
        let worker = tokio::spawn(serve(guest_read, guest_write, runtime()));

        let (host_read, mut host_write) = tokio::io::split(host);
        host_write
            .write_all(b"{\"id\":\"a\",\"type\":\"runCode\",\"code\":\"x\"}\n\n{\"id\":\"b\",\"type\":\"runCode\",\"code\":\"y\"}\n")
            .await
            .unwrap();
        host_write.shutdown().await.unwrap();

        let mut lines = BufReader::new(host_read).lines();
        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!((first["id"].clone(), first["stdout"].clone()), (json!("a"), json!("X")));
        assert_eq!((second["id"].clone(), second["stdout"].clone()), (json!("b"), json!("Y")));

        drop(host_write);
        worker.await.unwrap().unwrap();
    }
}
