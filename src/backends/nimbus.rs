use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CloudBackend, Termination};
use crate::config::NimbusSettings;
use crate::core::vm::{VMRequest, VMStatus};
use crate::errors::BackendError;

const DEPLOY_STATE: &str = "Running";

/// Drives a Nimbus cloud through the `workspace` command line client. The
/// backend id of a VM is the path of its EPR file.
pub struct NimbusBackend {
    service_address: String,
    settings: NimbusSettings,
}

impl NimbusBackend {
    pub fn new(service_address: impl Into<String>, settings: NimbusSettings) -> Self {
        Self {
            service_address: service_address.into(),
            settings,
        }
    }

    pub fn factory_url(&self) -> String {
        format!(
            "https://{}:{}/wsrf/services/WorkspaceFactoryService",
            self.service_address, self.settings.service_port
        )
    }

    pub fn create_args(&self, epr: &Path, metadata: &Path, memory_mb: u64) -> Vec<String> {
        vec![
            "-z".into(),
            "none".into(),
            "--poll-delay".into(),
            "200".into(),
            "--deploy".into(),
            "--file".into(),
            epr.display().to_string(),
            "--metadata".into(),
            metadata.display().to_string(),
            "--trash-at-shutdown".into(),
            "-s".into(),
            self.factory_url(),
            "--deploy-duration".into(),
            self.settings.deploy_duration_mins.to_string(),
            "--deploy-mem".into(),
            memory_mb.to_string(),
            "--deploy-state".into(),
            DEPLOY_STATE.into(),
            "--exit-state".into(),
            "Running".into(),
        ]
    }

    pub fn destroy_args(epr: &str) -> Vec<String> {
        vec!["-e".into(), epr.into(), "--destroy".into()]
    }

    pub fn poll_args(epr: &str) -> Vec<String> {
        vec!["-e".into(), epr.into(), "--rpquery".into()]
    }

    async fn run_workspace(&self, args: Vec<String>, backend_id: &str) -> Result<String, BackendError> {
        debug!(command = %self.settings.workspace_bin, args = ?args, "Running workspace command");
        let output = Command::new(&self.settings.workspace_bin)
            .args(&args)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!("{} {}", stderr.trim(), stdout.trim());
        if is_missing_workspace(&message) {
            Err(BackendError::NotFound(backend_id.to_string()))
        } else {
            Err(BackendError::Transient(format!(
                "workspace exited with {}: {}",
                output.status,
                message.trim()
            )))
        }
    }

    fn vm_log(&self) -> Result<(Stdio, Stdio), BackendError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.settings.log_file)?;
        let second = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(second)))
    }
}

/// Workspace metadata document for one VM.
pub fn metadata_document(request: &VMRequest) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<VirtualWorkspace xmlns="http://www.globus.org/2008/06/workspace/metadata">
  <name>{}</name>
  <logistics>
    <networking>
      <nic>
        <name>eth0</name>
        <association>{}</association>
      </nic>
    </networking>
  </logistics>
  <requirements>
    <CPUArchitecture>{}</CPUArchitecture>
  </requirements>
  <definition>
    <diskCollection>
      <rootVBD>
        <location>{}</location>
        <mountAs>sda1</mountAs>
        <permissions>ReadWrite</permissions>
      </rootVBD>
    </diskCollection>
  </definition>
</VirtualWorkspace>
"#,
        xml_escape(&request.name),
        xml_escape(&request.network),
        xml_escape(&request.cpu_arch),
        xml_escape(&request.image_location)
    )
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

pub fn epr_file_name(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "nimbusVM_{}_{}.epr",
        now.format("%Y-%m-%dT%H:%M:%S%.6f"),
        &suffix[..8]
    )
}

/// Pulls the state out of `workspace --rpquery` output.
pub fn parse_rpquery_state(output: &str) -> Option<&str> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("state") {
            value.split_whitespace().next()
        } else {
            None
        }
    })
}

fn is_missing_workspace(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["does not exist", "unknown workspace", "no such resource", "not found"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[async_trait]
impl CloudBackend for NimbusBackend {
    fn cloud_type(&self) -> &str {
        "Nimbus"
    }

    async fn create(&self, request: &VMRequest) -> Result<String, BackendError> {
        let work_dir = PathBuf::from(&self.settings.work_dir);
        tokio::fs::create_dir_all(&work_dir).await?;

        let epr = work_dir.join(epr_file_name(Utc::now()));
        let metadata = epr.with_extension("xml");
        tokio::fs::write(&metadata, metadata_document(request)).await?;

        let args = self.create_args(&epr, &metadata, request.memory_mb);
        let (stdout, stderr) = self.vm_log()?;
        let mut child = Command::new(&self.settings.workspace_bin)
            .args(&args)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        info!(vm = %request.name, epr = %epr.display(), "Nimbus: workspace create command executed");

        // The deploy keeps running on its own; we only want to hear how it ended.
        let epr_label = epr.display().to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(epr = %epr_label, "workspace deploy finished"),
                Ok(status) => warn!(epr = %epr_label, %status, "workspace deploy exited with failure"),
                Err(e) => warn!(epr = %epr_label, error = %e, "Lost track of workspace deploy"),
            }
        });

        Ok(epr.display().to_string())
    }

    async fn shutdown(&self, backend_id: &str) -> Result<Termination, BackendError> {
        self.run_workspace(Self::destroy_args(backend_id), backend_id)
            .await
            .map(|_| Termination::Confirmed)
    }

    async fn kill(&self, backend_id: &str) -> Result<(), BackendError> {
        self.run_workspace(Self::destroy_args(backend_id), backend_id)
            .await
            .map(|_| ())
    }

    async fn status(&self, backend_id: &str) -> Result<String, BackendError> {
        let output = self.run_workspace(Self::poll_args(backend_id), backend_id).await?;
        parse_rpquery_state(&output)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Transient("rpquery output had no State line".into()))
    }

    fn map_status(&self, raw: &str) -> Option<VMStatus> {
        match raw {
            "Unstaged" | "Unpropagated" | "Propagated" | "Paused" => Some(VMStatus::Starting),
            "Running" => Some(VMStatus::Running),
            "TransportReady" | "StagedOut" | "Cancelled" | "Destroyed" => Some(VMStatus::Shutdown),
            s if s.starts_with("Corrupted") => Some(VMStatus::Error),
            _ => None,
        }
    }
}
