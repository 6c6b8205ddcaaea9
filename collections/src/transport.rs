//! Bank submission transport
//!
//! The engine hands serialized pain.008 files to a [`BankTransport`]
//! implementation. Production deployments wire in an SFTP or EBICS
//! client; tests use [`MockBankTransport`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Bank acknowledgement for a submitted file
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    /// Batch reference the bank acknowledged
    pub reference: String,

    /// Acceptance timestamp
    pub accepted_at: DateTime<Utc>,
}

/// Channel that delivers collection files to the bank
#[async_trait]
pub trait BankTransport: Send + Sync {
    /// Submit one serialized pain.008 file
    ///
    /// Implementations must be safe to call again with the same
    /// reference after a failure; the engine retries submissions.
    async fn submit(&self, reference: &str, xml: &str) -> Result<SubmissionReceipt>;
}

/// In-memory transport for tests
///
/// Records every submission and can be told to fail the next N calls.
#[derive(Default)]
pub struct MockBankTransport {
    submissions: Mutex<Vec<(String, String)>>,
    failures_remaining: Mutex<u32>,
}

impl MockBankTransport {
    /// Create a transport that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` submissions with a transport error
    pub fn fail_next(&self, n: u32) {
        *self.failures_remaining.lock() = n;
    }

    /// Snapshot of (reference, xml) pairs submitted so far
    pub fn submissions(&self) -> Vec<(String, String)> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl BankTransport for MockBankTransport {
    async fn submit(&self, reference: &str, xml: &str) -> Result<SubmissionReceipt> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Transport(format!(
                    "Simulated transport failure for {}",
                    reference
                )));
            }
        }
        self.submissions
            .lock()
            .push((reference.to_string(), xml.to_string()));
        Ok(SubmissionReceipt {
            reference: reference.to_string(),
            accepted_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_submissions() {
        let transport = MockBankTransport::new();
        let receipt = transport.submit("COL-1", "<xml/>").await.unwrap();
        assert_eq!(receipt.reference, "COL-1");
        assert_eq!(transport.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_fails_then_recovers() {
        let transport = MockBankTransport::new();
        transport.fail_next(2);
        assert!(transport.submit("COL-1", "<xml/>").await.is_err());
        assert!(transport.submit("COL-1", "<xml/>").await.is_err());
        assert!(transport.submit("COL-1", "<xml/>").await.is_ok());
        assert_eq!(transport.submissions().len(), 1);
    }
}
