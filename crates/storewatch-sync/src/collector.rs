//! # Collector Runner
//!
//! Runs the external marketplace collector for one platform and turns its
//! output into typed records.
//!
//! ## Execution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  run_collector(platform, timeout, cancel)                               │
//! │                                                                         │
//! │  spawn  command args[{platform} → grab]   (kill_on_drop)                │
//! │    │                                                                    │
//! │    ├── stdout ─┐                                                        │
//! │    └── stderr ─┴─► combined output, line by line in arrival order       │
//! │                                                                         │
//! │  select!                                                                │
//! │    exit        → non-zero?  CollectorExit (output kept for the log)     │
//! │    timeout     → kill       CollectorTimeout                            │
//! │    cancelled   → kill       Cancelled                                   │
//! │                                                                         │
//! │  last well-formed top-level {...} in the output                         │
//! │    none / not an object / bad records → CollectorParse                  │
//! │                                                                         │
//! │  write collector-<platform>.json (temp file + rename)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Output Contract
//! Exactly one JSON object somewhere in the combined output, keyed by
//! platform:
//! ```json
//! { "grab": [ { "shopId": "S1", "itemId": "42", "price": 12.5, "available": true } ] }
//! ```
//! A record without `itemId` describes the store itself on that platform.
//! `online` is accepted in place of `available`.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CollectorSettings;
use crate::error::{SyncError, SyncResult};
use crate::partner::price_to_cents;
use storewatch_core::{ItemObservation, Platform, Source};

/// How long to wait for pipe readers after the process exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Types
// =============================================================================

/// What the child process did.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub combined_output: String,
    pub duration: Duration,
}

/// One record from the collector payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CollectorRecord {
    #[serde(alias = "shopId", deserialize_with = "crate::partner::id_string")]
    pub shop_id: String,
    #[serde(
        default,
        alias = "itemId",
        deserialize_with = "crate::partner::opt_id_string"
    )]
    pub item_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(alias = "online")]
    pub available: bool,
    /// The record as emitted, unknown fields included.
    #[serde(skip)]
    pub raw: Value,
}

impl CollectorRecord {
    /// True for a store-level record (no item id).
    pub fn is_store_level(&self) -> bool {
        self.item_id
            .as_deref()
            .map_or(true, |id| id.trim().is_empty())
    }

    pub fn to_observation(&self, platform: Platform) -> ItemObservation {
        ItemObservation {
            shop_id: self.shop_id.clone(),
            item_id: platform.item_key(self.item_id.as_deref()),
            source: Source::from(platform),
            name: self.name.clone(),
            code: self.code.clone(),
            category: self.category.clone(),
            price_cents: self.price.map(price_to_cents),
            available: self.available,
            payload: self.raw.clone(),
        }
    }
}

/// A successful collector run.
#[derive(Debug, Clone)]
pub struct CollectorOutput {
    pub platform: Platform,
    pub outcome: ProcessOutcome,
    /// The whole extracted JSON object.
    pub payload: Map<String, Value>,
    pub records: Vec<CollectorRecord>,
}

impl CollectorOutput {
    pub fn observations(&self) -> Vec<ItemObservation> {
        self.records
            .iter()
            .map(|r| r.to_observation(self.platform))
            .collect()
    }
}

// =============================================================================
// JSON Extraction
// =============================================================================

/// The last well-formed top-level JSON object in `output`.
///
/// Objects nested inside an accepted object are skipped; text that merely
/// looks like an object (unbalanced or invalid) is ignored.
pub fn extract_last_json_object(output: &str) -> Option<Map<String, Value>> {
    let mut last = None;
    let mut pos = 0;

    while let Some(found) = output[pos..].find('{') {
        let start = pos + found;
        let mut stream = serde_json::Deserializer::from_str(&output[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(object))) => {
                pos = start + stream.byte_offset();
                last = Some(object);
            }
            _ => pos = start + 1,
        }
    }

    last
}

/// Typed records for `platform` from an extracted payload.
pub fn parse_records(
    platform: Platform,
    payload: &Map<String, Value>,
) -> Result<Vec<CollectorRecord>, String> {
    let rows = match payload.get(platform.as_str()) {
        Some(Value::Array(rows)) => rows,
        Some(_) => return Err(format!("\"{platform}\" is not an array")),
        None => return Err(format!("no \"{platform}\" key in collector output")),
    };

    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let mut record: CollectorRecord = serde_json::from_value(row.clone())
                .map_err(|e| format!("record {index}: {e}"))?;
            record.raw = row.clone();
            Ok(record)
        })
        .collect()
}

// =============================================================================
// CollectorRunner
// =============================================================================

/// Spawns the collector command.
#[derive(Debug, Clone)]
pub struct CollectorRunner {
    settings: CollectorSettings,
}

impl CollectorRunner {
    pub fn new(settings: CollectorSettings) -> Self {
        CollectorRunner { settings }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Side file path for a platform.
    pub fn side_file(&self, platform: Platform) -> PathBuf {
        self.settings
            .cache_dir
            .join(format!("collector-{}.json", platform.as_str()))
    }

    /// Runs the collector once for `platform`.
    pub async fn run_collector(
        &self,
        platform: Platform,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<CollectorOutput> {
        let outcome = self.execute(platform, timeout, cancel).await?;

        if outcome.exit_code != Some(0) {
            warn!(
                platform = %platform,
                exit_code = ?outcome.exit_code,
                elapsed_ms = outcome.duration.as_millis() as u64,
                output = %outcome.combined_output,
                "Collector failed"
            );
            return Err(SyncError::CollectorExit {
                platform: platform.to_string(),
                code: outcome.exit_code,
                output: outcome.combined_output,
            });
        }

        let parse_error = |reason: String, output: &str| SyncError::CollectorParse {
            platform: platform.to_string(),
            reason,
            output: output.to_string(),
        };

        let payload = extract_last_json_object(&outcome.combined_output).ok_or_else(|| {
            parse_error("no JSON object in output".into(), &outcome.combined_output)
        })?;
        let records = parse_records(platform, &payload)
            .map_err(|reason| parse_error(reason, &outcome.combined_output))?;

        if let Err(e) = self.write_side_file(platform, &payload).await {
            warn!(platform = %platform, error = %e, "Failed to write collector side file");
        }

        info!(
            platform = %platform,
            records = records.len(),
            elapsed_ms = outcome.duration.as_millis() as u64,
            "Collector finished"
        );

        Ok(CollectorOutput {
            platform,
            outcome,
            payload,
            records,
        })
    }

    async fn execute(
        &self,
        platform: Platform,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<ProcessOutcome> {
        let started = Instant::now();
        let args = self.settings.args_for(platform);
        debug!(platform = %platform, command = %self.settings.command, ?args, "Spawning collector");

        let mut child = Command::new(&self.settings.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncError::CollectorSpawn {
                platform: platform.to_string(),
                reason: e.to_string(),
            })?;

        let combined = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, combined.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, combined.clone())));
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| SyncError::CollectorSpawn {
                platform: platform.to_string(),
                reason: format!("wait failed: {e}"),
            }),
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    platform = %platform,
                    timeout_secs = timeout.as_secs(),
                    "Collector timed out, killing"
                );
                Err(SyncError::CollectorTimeout {
                    platform: platform.to_string(),
                    secs: timeout.as_secs(),
                })
            }
            _ = cancel.cancelled() => {
                info!(platform = %platform, "Collector cancelled, killing");
                Err(SyncError::Cancelled)
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let _ = child.kill().await;
                for reader in &readers {
                    reader.abort();
                }
                return Err(e);
            }
        };

        let drain = async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            debug!(platform = %platform, "Collector pipes still open after exit");
        }
        for reader in &readers {
            reader.abort();
        }

        let combined_output = combined.lock().await.clone();
        Ok(ProcessOutcome {
            exit_code: status.code(),
            combined_output,
            duration: started.elapsed(),
        })
    }

    async fn write_side_file(
        &self,
        platform: Platform,
        payload: &Map<String, Value>,
    ) -> SyncResult<()> {
        tokio::fs::create_dir_all(&self.settings.cache_dir).await?;
        let path = self.side_file(platform);
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(payload)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "Collector side file written");
        Ok(())
    }

    /// Last payload written for `platform`, if any.
    pub async fn load_cached(&self, platform: Platform) -> SyncResult<Option<Map<String, Value>>> {
        read_side_file(&self.side_file(platform)).await
    }
}

async fn read_side_file(path: &Path) -> SyncResult<Option<Map<String, Value>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Copies lines into `combined` until EOF. Bytes that are not UTF-8 are
/// replaced rather than ending the read, so the child never sees a closed pipe.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, combined: Arc<Mutex<String>>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let mut out = combined.lock().await;
                out.push_str(text.trim_end_matches(['\r', '\n']));
                out.push('\n');
            }
            Err(e) => {
                debug!(error = %e, "Collector pipe read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(script: &str, dir: &Path) -> CollectorRunner {
        CollectorRunner::new(CollectorSettings {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout_secs: 5,
            cache_dir: dir.to_path_buf(),
            platforms: vec![Platform::Grab],
        })
    }

    #[test]
    fn test_extract_last_object_skips_noise() {
        let output = r#"
            starting {collector}
            {"progress": 1}
            {"grab": [{"shopId": "S1", "name": "Braces } in { strings", "available": true}]}
            done {
        "#;
        let object = extract_last_json_object(output).unwrap();
        assert!(object.contains_key("grab"));
        assert!(!object.contains_key("progress"));
    }

    #[test]
    fn test_extract_ignores_trailing_malformed_object() {
        let output = "{\"grab\": []}\n{\"broken\": tru}\n";
        let object = extract_last_json_object(output).unwrap();
        assert!(object.contains_key("grab"));
        assert!(extract_last_json_object("no json here").is_none());
        assert!(extract_last_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_parse_records_and_observations() {
        let payload = extract_last_json_object(
            r#"{"grab": [
                {"shopId": "S1", "online": false},
                {"shopId": 7, "itemId": 42, "price": 12.5, "available": true, "extra": "kept"}
            ]}"#,
        )
        .unwrap();
        let records = parse_records(Platform::Grab, &payload).unwrap();

        assert!(records[0].is_store_level());
        assert!(!records[0].available);
        let obs = records[1].to_observation(Platform::Grab);
        assert_eq!(obs.shop_id, "7");
        assert_eq!(obs.item_id, "grab:42");
        assert_eq!(obs.source, Source::Grab);
        assert_eq!(obs.price_cents, Some(1250));
        assert_eq!(obs.payload["extra"], "kept");

        assert!(parse_records(Platform::Foodpanda, &payload).is_err());
        let bad = extract_last_json_object(r#"{"grab": [{"name": "no shop"}]}"#).unwrap();
        assert!(parse_records(Platform::Grab, &bad).is_err());
    }

    #[tokio::test]
    async fn test_successful_run_writes_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = concat!(
            r#"echo "log line"; echo warn >&2; "#,
            r#"echo '{"{platform}": [{"shopId": "S1", "available": false}]}'; echo bye"#
        );
        let runner = runner(script, dir.path());

        let output = runner
            .run_collector(Platform::Grab, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.outcome.exit_code, Some(0));
        assert!(output.outcome.combined_output.contains("warn"));
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.observations()[0].item_id, "grab");

        let cached = runner.load_cached(Platform::Grab).await.unwrap().unwrap();
        assert!(cached.contains_key("grab"));
        assert!(runner.load_cached(Platform::Deliveroo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_regardless_of_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo '{"grab": []}'; echo "scraper crashed" >&2; exit 1"#;
        let runner = runner(script, dir.path());

        let err = runner
            .run_collector(Platform::Grab, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            SyncError::CollectorExit { code, output, .. } => {
                assert_eq!(code, Some(1));
                assert!(output.contains("scraper crashed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!runner.side_file(Platform::Grab).exists());
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let script = concat!(
            r#"printf 'caf\351 page\n'; "#,
            r#"echo '{"grab": [{"shopId": "S1", "itemId": "9", "available": true}]}'"#
        );
        let runner = runner(script, dir.path());

        let output = runner
            .run_collector(Platform::Grab, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.outcome.exit_code, Some(0));
        assert!(output.outcome.combined_output.contains("caf\u{FFFD} page"));
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.observations()[0].item_id, "grab:9");
    }

    #[tokio::test]
    async fn test_missing_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner("echo nothing useful", dir.path());

        let err = runner
            .run_collector(Platform::Grab, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::CollectorParse { .. }));
        assert_eq!(err.collector_output().map(str::trim), Some("nothing useful"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner("sleep 10", dir.path());
        let started = Instant::now();

        let err = runner
            .run_collector(Platform::Grab, Duration::from_millis(200), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::CollectorTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner("sleep 10", dir.path());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = runner
            .run_collector(Platform::Grab, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
