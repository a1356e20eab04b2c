//! Append-only capture store.
//!
//! One record per LF-terminated line. A line is either a JSON object or the
//! literal prefix `ENC:` followed by base64url (no padding) of an AEAD
//! ciphertext whose plaintext is that JSON object. Readers are mixed-mode
//! tolerant: plaintext and encrypted lines may share a file.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use fs2::FileExt;

use crate::crypto::StoreKey;
use crate::error::{Error, Result};
use crate::headers;
use chrono::{DateTime, Utc};
use cm_protocol::{CaptureRecord, Selector};

/// Records at or above this serialized size are rejected.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Lines above this size are skipped before parsing.
pub const MAX_LINE_BYTES: usize = 2 * 1024 * 1024;

const ENC_PREFIX: &str = "ENC:";

/// Per-load counters for lines that could not be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Lines that were over-length, not valid base64, or not valid JSON.
    pub corrupt_lines: u64,
    /// Encrypted lines that failed authentication under the supplied key.
    pub auth_failures: u64,
}

/// Exclusive append-only writer.
///
/// Holds an exclusive advisory lock for its lifetime, so two captures cannot
/// interleave writes into one file. Every append is flushed; `close` syncs.
#[derive(Debug)]
pub struct StoreWriter {
    file: File,
    path: PathBuf,
    key: Option<StoreKey>,
    bytes_written: u64,
}

impl StoreWriter {
    pub fn open_append(path: &Path, key: Option<StoreKey>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::ConfigInvalid(format!(
                "capture store {} is locked by another writer",
                path.display()
            ))
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            key,
            bytes_written: 0,
        })
    }

    /// Appends one record as a single atomic line.
    pub fn append(&mut self, record: &CaptureRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        if json.len() >= MAX_RECORD_BYTES {
            return Err(Error::RecordTooLarge {
                size: json.len(),
                limit: MAX_RECORD_BYTES,
            });
        }

        let mut line = match &self.key {
            Some(key) => {
                let ciphertext = key.encrypt(json.as_bytes())?;
                format!("{ENC_PREFIX}{}", URL_SAFE_NO_PAD.encode(ciphertext))
            }
            None => json,
        };
        line.push('\n');

        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Syncs to disk and releases the lock.
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Loads every readable record, in file order.
///
/// Malformed lines and authentication failures are local: counted and
/// skipped. An `ENC:` line with no key supplied is fatal and yields no
/// records at all.
pub fn load_all(path: &Path, key: Option<&StoreKey>) -> Result<(Vec<CaptureRecord>, LoadStats)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut stats = LoadStats::default();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > MAX_LINE_BYTES {
            stats.corrupt_lines += 1;
            continue;
        }

        let json = match trimmed.strip_prefix(ENC_PREFIX) {
            Some(encoded) => {
                let Some(key) = key else {
                    return Err(Error::EncryptedStoreRequiresKey);
                };
                let Ok(ciphertext) = URL_SAFE_NO_PAD.decode(encoded.as_bytes()) else {
                    stats.corrupt_lines += 1;
                    continue;
                };
                match key.decrypt(&ciphertext) {
                    Ok(plaintext) => match String::from_utf8(plaintext) {
                        Ok(json) => json,
                        Err(_) => {
                            stats.corrupt_lines += 1;
                            continue;
                        }
                    },
                    Err(Error::CaptureAuthFailure) => {
                        stats.auth_failures += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            None => trimmed.to_string(),
        };

        match serde_json::from_str::<CaptureRecord>(&json) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping corrupt capture line");
                stats.corrupt_lines += 1;
            }
        }
    }

    Ok((records, stats))
}

/// Applies selector filters in record order. With `index` set the Nth match
/// (0-based) wins; otherwise the last match does, since the most recent
/// observation is the most likely to still carry valid auth.
pub fn select<'a>(records: &'a [CaptureRecord], selector: &Selector) -> Option<&'a CaptureRecord> {
    let mut matches = records.iter().filter(|record| {
        selector
            .url_contains
            .as_ref()
            .is_none_or(|needle| record.url.contains(needle.as_str()))
            && selector
                .method
                .as_ref()
                .is_none_or(|method| record.method.eq_ignore_ascii_case(method))
            && selector
                .resource_type
                .as_ref()
                .is_none_or(|rt| record.resource_type == *rt)
    });

    match selector.index {
        Some(index) => matches.nth(index),
        None => matches.last(),
    }
}

/// Per-record digest used by listings and auth checks. Values are never
/// included; only which auth header names are present.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordSummary {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub resource_type: String,
    pub captured_at: DateTime<Utc>,
    pub auth_headers: Vec<String>,
    pub has_auth: bool,
}

pub fn summarize(records: &[CaptureRecord]) -> Vec<RecordSummary> {
    records
        .iter()
        .map(|record| {
            let auth_headers: Vec<String> = record
                .headers
                .iter()
                .filter(|(name, _)| headers::is_auth(name))
                .map(|(name, _)| name.to_string())
                .collect();
            RecordSummary {
                request_id: record.request_id.clone(),
                method: record.method.clone(),
                url: record.url.clone(),
                resource_type: record.resource_type.clone(),
                captured_at: record.captured_at,
                has_auth: !auth_headers.is_empty(),
                auth_headers,
            }
        })
        .collect()
}
