//! Log record signing
//!
//! Each record is signed with HMAC-SHA256 over its signature metadata
//! (worker, job, step order, line counter, timestamp), keyed on the job's
//! signing key handed out by the controller when the job is taken.

use brigade_core::domain::log::{LogRecord, LogSignature, SignedLog};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs the log records of one job
#[derive(Clone)]
pub struct LogSigner {
    worker: String,
    job_name: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for LogSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSigner")
            .field("worker", &self.worker)
            .field("job_name", &self.job_name)
            .finish_non_exhaustive()
    }
}

impl LogSigner {
    /// Creates a signer from the job's hex-encoded key
    ///
    /// A key that is not valid hex is used as raw bytes.
    pub fn new(worker: impl Into<String>, job_name: impl Into<String>, key: &str) -> Self {
        let key = hex::decode(key).unwrap_or_else(|_| key.as_bytes().to_vec());
        Self {
            worker: worker.into(),
            job_name: job_name.into(),
            key,
        }
    }

    /// Metadata covered by the signature of `record`
    pub fn metadata(&self, record: &LogRecord) -> LogSignature {
        LogSignature {
            worker: self.worker.clone(),
            job_id: record.job_id,
            job_name: self.job_name.clone(),
            step_order: record.step_order,
            line: record.line,
            timestamp: record.last_modified.timestamp_millis(),
        }
    }

    /// Hex-encoded signature of `metadata`
    pub fn sign(&self, metadata: &LogSignature) -> anyhow::Result<String> {
        if self.key.is_empty() {
            anyhow::bail!("no signing key for job {}", metadata.job_id);
        }

        let payload = serde_json::to_vec(metadata)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid signing key: {}", e))?;
        mac.update(&payload);

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks a signature produced by [`LogSigner::sign`]
    pub fn verify(&self, metadata: &LogSignature, signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(payload) = serde_json::to_vec(metadata) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(&payload);
        mac.verify_slice(&expected).is_ok()
    }

    /// Wraps `record` in its signature envelope
    ///
    /// A signing failure is logged locally and the signature is omitted.
    pub fn wrap(&self, record: LogRecord) -> SignedLog {
        let metadata = self.metadata(&record);
        let signature = match self.sign(&metadata) {
            Ok(signature) => Some(signature),
            Err(e) => {
                tracing::error!(
                    "Cannot sign log line {} of job {}: {:#}",
                    record.line,
                    record.job_id,
                    e
                );
                None
            }
        };

        SignedLog {
            record,
            metadata,
            signature,
        }
    }
}
