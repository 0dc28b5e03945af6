//! Scripted transport for unit tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::transport::{HttpResponse, HttpTransport};
use crate::error::{Error, Result};

type Responder = Box<dyn Fn(&str) -> Result<HttpResponse> + Send + Sync>;

/// Answers every GET with a closure and records the URLs it was asked for.
pub(crate) struct ScriptedTransport {
    responder: Responder,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        responder: impl Fn(&str) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Every request fails at the network layer.
    pub(crate) fn failing() -> Arc<Self> {
        Self::new(|_| Err(Error::network("connection refused")))
    }

    /// Every request returns 200 with `body`.
    pub(crate) fn always(body: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(HttpResponse::ok(body)))
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.calls.lock().unwrap().push(url.to_string());
        (self.responder)(url)
    }
}

/// Never answers; every request hangs until the caller gives up.
#[derive(Default)]
pub(crate) struct HangingTransport {
    calls: Mutex<usize>,
}

impl HangingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl HttpTransport for HangingTransport {
    async fn get(&self, _url: &str) -> Result<HttpResponse> {
        *self.calls.lock().unwrap() += 1;
        std::future::pending().await
    }
}
