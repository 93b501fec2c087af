//! Long-lived stage threads reachable only through byte frames.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::protocol::{self, ProtocolError};
use crate::model::RequestId;

/// Request handler run inside a stage thread.
///
/// `handle` must report script failures as replies; a panic is caught by the
/// serve loop and converted with [`StageService::fault`].
pub trait StageService: Send + 'static {
    type Request: DeserializeOwned;
    type Reply: Serialize;

    const NAME: &'static str;

    fn request_id(request: &Self::Request) -> RequestId;

    fn handle(&mut self, request: Self::Request) -> Vec<Self::Reply>;

    fn fault(request_id: RequestId, message: String) -> Self::Reply;
}

/// Native stack for each stage thread. Parsing and lowering recurse per
/// nesting level, bounded by the compiler's depth limits.
const STAGE_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Controller-side end of a stage.
pub struct StageHandle {
    name: &'static str,
    requests: Option<UnboundedSender<Bytes>>,
    replies: UnboundedReceiver<Bytes>,
    thread: Option<JoinHandle<()>>,
}

impl StageHandle {
    pub fn spawn<S: StageService>(service: S) -> Result<Self> {
        let (req_tx, req_rx) = mpsc::unbounded_channel::<Bytes>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Bytes>();
        let thread = std::thread::Builder::new()
            .name(format!("{}-stage", S::NAME))
            .stack_size(STAGE_STACK_SIZE)
            .spawn(move || serve(service, req_rx, reply_tx))
            .with_context(|| format!("failed to spawn {} stage thread", S::NAME))?;
        tracing::debug!(stage = S::NAME, "stage started");
        Ok(Self {
            name: S::NAME,
            requests: Some(req_tx),
            replies: reply_rx,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn post(&self, frame: Bytes) -> Result<(), ProtocolError> {
        self.requests
            .as_ref()
            .ok_or(ProtocolError::StageClosed(self.name))?
            .send(frame)
            .map_err(|_| ProtocolError::StageClosed(self.name))
    }

    /// Next reply frame; `None` once the stage thread has exited.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.replies.recv().await
    }

    /// Close the request channel and wait up to `grace` for the thread to exit.
    ///
    /// A stage stuck in user code cannot be interrupted; it is detached and
    /// dies with the process.
    pub async fn shutdown(mut self, grace: Duration) {
        self.requests.take();
        let Some(thread) = self.thread.take() else {
            return;
        };
        let deadline = tokio::time::Instant::now() + grace;
        while !thread.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    stage = self.name,
                    grace_ms = grace.as_millis() as u64,
                    "stage still busy after grace period; detaching"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if thread.join().is_err() {
            tracing::error!(stage = self.name, "stage thread panicked outside a request");
        } else {
            tracing::debug!(stage = self.name, "stage stopped");
        }
    }
}

fn serve<S: StageService>(
    mut service: S,
    mut requests: UnboundedReceiver<Bytes>,
    replies: UnboundedSender<Bytes>,
) {
    while let Some(frame) = requests.blocking_recv() {
        let request: S::Request = match protocol::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(stage = S::NAME, "dropping malformed request: {e}");
                continue;
            }
        };
        let request_id = S::request_id(&request);
        tracing::debug!(stage = S::NAME, %request_id, bytes = frame.len(), "request received");

        let out = match catch_unwind(AssertUnwindSafe(|| service.handle(request))) {
            Ok(out) => out,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(stage = S::NAME, %request_id, "request panicked: {message}");
                vec![S::fault(request_id, format!("internal {} fault: {message}", S::NAME))]
            }
        };

        for reply in out {
            let frame = match protocol::encode(&reply) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(stage = S::NAME, %request_id, "{e}");
                    match protocol::encode(&S::fault(request_id, e.to_string())) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    }
                }
            };
            if replies.send(frame).is_err() {
                // Controller is gone.
                return;
            }
        }
    }
    tracing::debug!(stage = S::NAME, "request channel closed");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        id: u64,
        text: String,
    }

    struct EchoService;

    impl StageService for EchoService {
        type Request = Echo;
        type Reply = Echo;
        const NAME: &'static str = "echo";

        fn request_id(request: &Echo) -> RequestId {
            RequestId(request.id)
        }

        fn handle(&mut self, request: Echo) -> Vec<Echo> {
            if request.text == "panic" {
                panic!("asked to panic");
            }
            vec![Echo {
                id: request.id,
                text: request.text.to_uppercase(),
            }]
        }

        fn fault(request_id: RequestId, message: String) -> Echo {
            Echo {
                id: request_id.0,
                text: message,
            }
        }
    }

    #[tokio::test]
    async fn test_stage_replies_and_survives_panics() {
        let mut stage = StageHandle::spawn(EchoService).unwrap();
        assert_eq!(stage.name(), "echo");

        stage.post(Bytes::from_static(b"not json")).unwrap();
        let panic_req = Echo { id: 1, text: "panic".into() };
        stage.post(protocol::encode(&panic_req).unwrap()).unwrap();
        let ok_req = Echo { id: 2, text: "hi".into() };
        stage.post(protocol::encode(&ok_req).unwrap()).unwrap();

        let fault: Echo = protocol::decode(&stage.recv().await.unwrap()).unwrap();
        assert_eq!(fault.id, 1);
        assert!(fault.text.contains("asked to panic"));

        let reply: Echo = protocol::decode(&stage.recv().await.unwrap()).unwrap();
        assert_eq!(reply.id, 2);
        assert_eq!(reply.text, "HI");

        stage.shutdown(Duration::from_secs(1)).await;
    }
}
