//! JSONL sink for `gatekeeper`. Appends one security event per line.
//! Always writes; bring your own path.

use gatekeeper::events::{SecurityEvent, SecurityEventSink};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<SecurityEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SecurityEvent) -> Self::Future {
        let path = self.path.clone();
        let line = serde_json::to_string(&event).map(|json| json + "\n");
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let line = line?;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(target: "gatekeeper_jsonl", path = %path.display(), kind = %event.kind, "event written");
            Ok(())
        })
    }
}

impl SecurityEventSink for JsonlSink {
    type SinkError = io::Error;
}
