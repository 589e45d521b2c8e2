//! Instance probes.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time;

use crate::error::ReturnCode;
use crate::model::Instance;

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectResult {
    pub return_code: ReturnCode,
    pub elapsed: Duration,
}

impl DetectResult {
    pub fn is_success(&self) -> bool {
        self.return_code == ReturnCode::Ok
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = DetectResult> + Send + 'a>>;

/// Detects whether an instance answers.
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect<'a>(&'a self, instance: &'a Instance, timeout: Duration) -> ProbeFuture<'a>;
}

/// Succeeds when a TCP connection to the instance opens in time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl HealthProbe for TcpProbe {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn detect<'a>(&'a self, instance: &'a Instance, timeout: Duration) -> ProbeFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            let address = instance.address();
            let return_code = match time::timeout(timeout, TcpStream::connect(&address)).await {
                Ok(Ok(_)) => ReturnCode::Ok,
                Ok(Err(e)) => {
                    tracing::debug!(instance = %instance.id, addr = %address, error = %e, "TCP probe failed: connection error");
                    ReturnCode::NetworkFailed
                }
                Err(_) => {
                    tracing::debug!(instance = %instance.id, addr = %address, "TCP probe failed: timeout");
                    ReturnCode::Timeout
                }
            };
            DetectResult {
                return_code,
                elapsed: started.elapsed(),
            }
        })
    }
}
