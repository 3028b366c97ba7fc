use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PyletError, Result};
use crate::protocol::{decode_reply, encode_request, ExecutionReport, WorkerRequest};

type Pending = Arc<Mutex<Slots>>;

/// Outstanding calls. Once the worker's output closes no new slot is accepted.
#[derive(Default)]
struct Slots {
    calls: HashMap<String, oneshot::Sender<ExecutionReport>>,
    closed: bool,
}

/// Correlating request/response channel to a worker.
///
/// Each call gets a fresh correlation id and a one-shot slot in the pending
/// map. A background dispatch loop reads replies and resolves the slot whose
/// id matches; replies for unknown ids are ignored. Calls may overlap and
/// replies may arrive in any order.
pub struct RpcChannel {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    timeout: Option<Duration>,
    dispatcher: JoinHandle<()>,
}

impl RpcChannel {
    /// Attach to a worker's output (`reader`) and input (`writer`).
    ///
    /// `timeout` bounds every call; `None` waits for as long as it takes.
    pub fn new<R, W>(reader: R, writer: W, timeout: Option<Duration>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::default();
        let dispatcher = tokio::spawn(dispatch(reader, Arc::clone(&pending)));

        Self {
            writer: AsyncMutex::new(Box::new(writer)),
            pending,
            timeout,
            dispatcher,
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// The timeout covers the whole call: waiting for the writer, writing the
    /// request and waiting for the reply.
    pub async fn call(&self, request: &WorkerRequest) -> Result<ExecutionReport> {
        let deadline = self.timeout.map(|limit| Instant::now() + limit);

        let id = Uuid::new_v4().to_string();
        let mut line = encode_request(&id, request)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.slots();
            if slots.closed {
                return Err(PyletError::WorkerClosed);
            }
            slots.calls.insert(id.clone(), tx);
        }

        let written = match deadline {
            Some(at) => match tokio::time::timeout_at(at, self.write_line(&line)).await {
                Ok(written) => written,
                Err(_) => return Err(self.expire(&id, "write")),
            },
            None => self.write_line(&line).await,
        };

        if let Err(e) = written {
            debug!(id = %id, error = %e, "Failed to write request");
            self.forget(&id);
            return Err(PyletError::WorkerClosed);
        }

        let reply = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx).await {
                Ok(reply) => reply,
                Err(_) => return Err(self.expire(&id, "reply")),
            },
            None => rx.await,
        };

        reply.map_err(|_| PyletError::WorkerClosed)
    }

    /// Number of calls still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.slots().calls.len()
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    fn expire(&self, id: &str, stage: &str) -> PyletError {
        self.forget(id);
        let millis = self.timeout.map_or(0, |limit| limit.as_millis() as u64);
        warn!(id = %id, timeout_ms = millis, stage = stage, "Worker call timed out");
        PyletError::RpcTimeout { millis }
    }

    fn forget(&self, id: &str) {
        self.slots().calls.remove(id);
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch<R>(reader: R, pending: Pending)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => route(&line, &pending),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Worker output unreadable");
                break;
            }
        }
    }

    debug!("Worker output closed");
    // Dropping the senders fails every outstanding call with WorkerClosed.
    let mut slots = pending.lock().unwrap_or_else(PoisonError::into_inner);
    slots.closed = true;
    slots.calls.clear();
}

fn route(line: &str, pending: &Pending) {
    if line.trim().is_empty() {
        return;
    }

    let (id, report) = match decode_reply(line) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable worker reply");
            return;
        }
    };

    let slot = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .calls
        .remove(&id);

    match slot {
        Some(tx) => {
            // The caller may have given up (timeout) in the meantime.
            let _ = tx.send(report);
        }
        None => debug!(id = %id, "Ignoring reply with no pending call"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;

    fn run(code: &str) -> WorkerRequest {
        WorkerRequest::RunCode {
            code: code.to_string(),
        }
    }

    fn connect(timeout: Option<Duration>) -> (RpcChannel, DuplexStream) {
        let (host, worker) = tokio::io::duplex(8192);
        let (read, write) = tokio::io::split(host);
        (RpcChannel::new(read, write, timeout), worker)
    }

    /// Collects `batch` requests, then answers them newest first, echoing the
    /// code as stdout. Noise lines are written before the real replies.
    async fn reversing_worker(stream: DuplexStream, batch: usize, noise: Vec<String>) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();

        let mut requests = Vec::new();
        while requests.len() < batch {
            match lines.next_line().await.unwrap() {
                Some(line) => requests.push(serde_json::from_str::<Value>(&line).unwrap()),
                None => return,
            }
        }

        for line in noise {
            write.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }
        for request in requests.iter().rev() {
            let reply = json!({
                "id": request["id"],
                "ok": true,
                "exitCode": 0,
                "stdout": request["code"],
                "stderr": "",
            });
            write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        }
        write.flush().await.unwrap();

        while let Ok(Some(_)) = lines.next_line().await {}
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_never_cross_delivered() {
        let (channel, worker) = connect(Some(Duration::from_secs(5)));
        tokio::spawn(reversing_worker(worker, 3, Vec::new()));

        let (first, second, third) = (run("first"), run("second"), run("third"));
        let (a, b, c) = tokio::join!(
            channel.call(&first),
            channel.call(&second),
            channel.call(&third)
        );

        assert_eq!(a.unwrap().stdout, "first");
        assert_eq!(b.unwrap().stdout, "second");
        assert_eq!(c.unwrap().stdout, "third");
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stale_and_malformed_replies_are_ignored() {
        let (channel, worker) = connect(Some(Duration::from_secs(5)));
        let noise = vec![
            json!({"id": "stale", "ok": true, "stdout": "wrong"}).to_string(),
            json!({"ok": true, "stdout": "no id"}).to_string(),
            "garbage".to_string(),
        ];
        tokio::spawn(reversing_worker(worker, 1, noise));

        let report = channel.call(&run("mine")).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.stdout, "mine");
    }

    #[tokio::test]
    async fn test_outbound_message_carries_id_and_type() {
        let (channel, worker) = connect(Some(Duration::from_millis(200)));
        let (read, _write) = tokio::io::split(worker);
        let mut lines = BufReader::new(read).lines();

        let call = tokio::spawn(async move {
            channel
                .call(&WorkerRequest::Init {
                    index_url: Some("/opt".to_string()),
                })
                .await
        });

        let sent: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(sent["type"], "init");
        assert_eq!(sent["indexURL"], "/opt");
        assert!(Uuid::parse_str(sent["id"].as_str().unwrap()).is_ok());

        assert!(matches!(
            call.await.unwrap(),
            Err(PyletError::RpcTimeout { millis: 200 })
        ));
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let (channel, _worker) = connect(Some(Duration::from_millis(50)));

        let err = channel.call(&run("pass")).await.unwrap_err();
        assert!(matches!(err, PyletError::RpcTimeout { millis: 50 }));
        assert!(err.is_retryable());
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_covers_a_blocked_write() {
        let (channel, _unread_worker) = connect(Some(Duration::from_millis(200)));
        let large = run(&"x".repeat(65536));

        let outcome = tokio::time::timeout(Duration::from_secs(3), channel.call(&large))
            .await
            .expect("call must give up on its own");
        assert!(matches!(outcome, Err(PyletError::RpcTimeout { millis: 200 })));
        assert_eq!(channel.in_flight(), 0);

        // The pipe stays full; later calls are bounded too.
        let outcome = tokio::time::timeout(Duration::from_secs(3), channel.call(&run("small")))
            .await
            .expect("call must give up on its own");
        assert!(matches!(outcome, Err(PyletError::RpcTimeout { millis: 200 })));
    }

    #[tokio::test]
    async fn test_closed_worker_fails_pending_calls() {
        let (channel, worker) = connect(None);

        let closer = tokio::spawn(async move {
            let (read, _write) = tokio::io::split(worker);
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            // Dropping both halves closes the stream.
        });

        let err = channel.call(&run("pass")).await.unwrap_err();
        assert!(matches!(err, PyletError::WorkerClosed));
        closer.await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            channel.call(&run("again")).await,
            Err(PyletError::WorkerClosed)
        ));
    }
}
