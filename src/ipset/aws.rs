//! AWS WAFv2 regional IP set provider.
//!
//! Drives the `aws wafv2` command line client. The IP set lock token is the
//! version token; a stale token makes the CLI fail with
//! `WAFOptimisticLockException`, which is reported as a conflict. Requests
//! WAF rejects outright, such as an address family the set does not hold,
//! are validation errors and are not retried.
//!
//! The CLI child is killed if the call is dropped, so a timed-out update
//! can never land after the gateway has moved on.

use super::{AddressSetProvider, RawAddressSet, SetId, UpdateOutcome, VersionToken};
use crate::error::{JailError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

const SCOPE: &str = "REGIONAL";
const LOCK_EXCEPTION: &str = "WAFOptimisticLockException";
const REJECTED_EXCEPTIONS: [&str; 2] = ["WAFInvalidParameterException", "WAFInvalidOperationException"];

#[derive(Debug, Deserialize)]
struct ListIpSetsOutput {
    #[serde(rename = "IPSets", default)]
    ip_sets: Vec<IpSetSummary>,
}

#[derive(Debug, Deserialize)]
struct IpSetSummary {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct GetIpSetOutput {
    #[serde(rename = "IPSet")]
    ip_set: IpSetDetail,
    #[serde(rename = "LockToken")]
    lock_token: String,
}

#[derive(Debug, Deserialize)]
struct IpSetDetail {
    #[serde(rename = "Addresses", default)]
    addresses: Vec<String>,
}

/// WAFv2 IP set provider backed by the AWS CLI.
pub struct AwsWafProvider {
    cli: String,
    region: Option<String>,
}

impl AwsWafProvider {
    pub fn new(cli: impl Into<String>, region: Option<String>) -> Self {
        Self {
            cli: cli.into(),
            region,
        }
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        let mut cmd = Command::new(&self.cli);
        cmd.kill_on_drop(true)
            .arg("wafv2")
            .args(args)
            .args(["--scope", SCOPE, "--output", "json"]);
        if let Some(ref region) = self.region {
            cmd.args(["--region", region.as_str()]);
        }

        debug!(command = %args.first().map(String::as_str).unwrap_or(""), "Running aws wafv2");
        Ok(cmd.output().await?)
    }

    async fn run_ok(&self, args: &[String]) -> Result<Vec<u8>> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(JailError::Transient(format!(
                "aws wafv2 {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Find the id of the set called `name` in `list-ip-sets` output.
fn parse_list_output(json: &[u8], name: &str) -> Result<Option<SetId>> {
    let parsed: ListIpSetsOutput = serde_json::from_slice(json)
        .map_err(|e| JailError::Transient(format!("unexpected list-ip-sets output: {}", e)))?;

    let mut found: Option<SetId> = None;
    for set in parsed.ip_sets.into_iter().filter(|s| s.name == name) {
        if found.is_some() {
            warn!(set = %name, id = %set.id, "Multiple address sets share this name, using the first");
            continue;
        }
        found = Some(SetId {
            name: set.name,
            id: set.id,
        });
    }
    Ok(found)
}

fn parse_get_output(json: &[u8]) -> Result<RawAddressSet> {
    let parsed: GetIpSetOutput = serde_json::from_slice(json)
        .map_err(|e| JailError::Transient(format!("unexpected get-ip-set output: {}", e)))?;

    Ok(RawAddressSet {
        entries: parsed.ip_set.addresses,
        token: VersionToken(parsed.lock_token),
    })
}

fn update_args(set: &SetId, token: &VersionToken, entries: &[String]) -> Vec<String> {
    let mut args: Vec<String> = [
        "update-ip-set",
        "--name",
        set.name.as_str(),
        "--id",
        set.id.as_str(),
        "--lock-token",
        token.0.as_str(),
        "--addresses",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if entries.is_empty() {
        args.push("[]".to_string());
    } else {
        args.extend(entries.iter().cloned());
    }
    args
}

/// Outcome of a failed `update-ip-set`.
fn classify_update_failure(stderr: &str) -> Result<UpdateOutcome> {
    let stderr = stderr.trim();
    if stderr.contains(LOCK_EXCEPTION) {
        Ok(UpdateOutcome::Conflict)
    } else if REJECTED_EXCEPTIONS.iter().any(|e| stderr.contains(e)) {
        Err(JailError::validation("address set update", stderr))
    } else {
        Err(JailError::Transient(format!(
            "aws wafv2 update-ip-set failed: {}",
            stderr
        )))
    }
}

#[async_trait]
impl AddressSetProvider for AwsWafProvider {
    async fn find_set(&self, name: &str) -> Result<Option<SetId>> {
        let stdout = self.run_ok(&["list-ip-sets".to_string()]).await?;
        parse_list_output(&stdout, name)
    }

    async fn get_set(&self, set: &SetId) -> Result<RawAddressSet> {
        let args = [
            "get-ip-set".to_string(),
            "--name".to_string(),
            set.name.clone(),
            "--id".to_string(),
            set.id.clone(),
        ];
        let stdout = self.run_ok(&args).await?;
        parse_get_output(&stdout)
    }

    async fn update_set(
        &self,
        set: &SetId,
        token: &VersionToken,
        entries: &[String],
    ) -> Result<UpdateOutcome> {
        let output = self.run(&update_args(set, token, entries)).await?;
        if output.status.success() {
            return Ok(UpdateOutcome::Applied);
        }

        classify_update_failure(&String::from_utf8_lossy(&output.stderr))
    }

    fn name(&self) -> &str {
        "aws-wafv2"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> SetId {
        SetId {
            name: "fail2ban".to_string(),
            id: "a1b2c3d4".to_string(),
        }
    }

    #[test]
    fn test_parse_list_output() {
        let json = br#"{
            "NextMarker": "fail2ban",
            "IPSets": [
                {"Name": "allowlist", "Id": "zzz", "LockToken": "t1"},
                {"Name": "fail2ban", "Id": "a1b2c3d4", "LockToken": "t2"},
                {"Name": "fail2ban", "Id": "e5f6", "LockToken": "t3"}
            ]
        }"#;

        assert_eq!(parse_list_output(json, "fail2ban").unwrap(), Some(set()));
        assert_eq!(parse_list_output(json, "missing").unwrap(), None);
        assert_eq!(parse_list_output(b"{}", "fail2ban").unwrap(), None);
        assert!(parse_list_output(b"not json", "fail2ban").is_err());
    }

    #[test]
    fn test_parse_get_output() {
        let json = br#"{
            "IPSet": {
                "Name": "fail2ban",
                "Id": "a1b2c3d4",
                "IPAddressVersion": "IPV4",
                "Addresses": ["10.0.0.1/32", "10.1.0.0/16"]
            },
            "LockToken": "0f1e2d3c"
        }"#;

        let raw = parse_get_output(json).unwrap();
        assert_eq!(raw.entries, vec!["10.0.0.1/32", "10.1.0.0/16"]);
        assert_eq!(raw.token, VersionToken("0f1e2d3c".to_string()));
    }

    #[test]
    fn test_update_args() {
        let token = VersionToken("tok".to_string());
        let args = update_args(&set(), &token, &["10.0.0.1/32".to_string()]);
        assert_eq!(
            args,
            vec![
                "update-ip-set",
                "--name",
                "fail2ban",
                "--id",
                "a1b2c3d4",
                "--lock-token",
                "tok",
                "--addresses",
                "10.0.0.1/32"
            ]
        );

        let args = update_args(&set(), &token, &[]);
        assert_eq!(args.last().map(String::as_str), Some("[]"));
    }

    #[test]
    fn test_update_failure_classification() {
        let outcome = classify_update_failure(
            "An error occurred (WAFOptimisticLockException) when calling the UpdateIPSet operation",
        );
        assert_eq!(outcome.unwrap(), UpdateOutcome::Conflict);

        let err = classify_update_failure(
            "An error occurred (WAFInvalidParameterException) when calling the UpdateIPSet \
             operation: Error reason: The parameter contains formatting that is not valid., \
             field: IP_ADDRESS",
        )
        .unwrap_err();
        assert!(matches!(err, JailError::Validation { .. }));

        let err = classify_update_failure(
            "An error occurred (WAFLimitsExceededException) when calling the UpdateIPSet operation",
        )
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_cli_is_killed() {
        use crate::ipset::AddressSetGateway;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;
        use std::time::Duration;

        let dir = std::env::temp_dir().join(format!("fail2ban-aws-stub-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("finished");
        let script = dir.join("aws");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nsleep 1\ntouch '{}'\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let provider = Arc::new(AwsWafProvider::new(script.display().to_string(), None));
        let result =
            AddressSetGateway::connect(provider, "fail2ban", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(JailError::Configuration(_))));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
