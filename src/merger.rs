//! # Configuration Merger
//!
//! Derives the per-run container view from three independent sources: the
//! image metadata, the CLI request and the host state captured in
//! [`CommandRun`]. Precedence is fixed:
//!
//! - cwd: CLI override > image workdir > `/`
//! - environment: host environment overlaid with image environment (image
//!   wins on conflicts), then the GPU and hook-flag rules below
//! - argv: a CLI entrypoint replaces the image entrypoint *and* discards the
//!   image cmd; CLI exec args replace the image cmd
//! - hook environments: per-hook lists overlaid with the invocation-wide
//!   overrides (overrides win)
//!
//! ## GPU Visibility Remapping
//!
//! On hosts where the workload manager hands each job a subset of the GPUs
//! via `CUDA_VISIBLE_DEVICES`, the devices visible inside the container are
//! renumbered from zero. An image that requests GPU support (it carries
//! `NVIDIA_VISIBLE_DEVICES`) therefore gets:
//!
//! - `NVIDIA_VISIBLE_DEVICES` = the host selection, unchanged, so the hook
//!   mounts exactly the assigned devices;
//! - `CUDA_VISIBLE_DEVICES` = each host id replaced by its rank within the
//!   ascending sort of the selection (`3,1,5` becomes `1,0,2`);
//! - `NVIDIA_DRIVER_CAPABILITIES` defaulted to `all` when the image does
//!   not restrict it.
//!
//! When the host assigns no device (`CUDA_VISIBLE_DEVICES` absent, empty,
//! or the `NoDevFiles` sentinel) all three keys are stripped so the hook
//! stays inert.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::bundle::{OciHook, OciHooks};
use crate::config::CommandRun;
use crate::constants::{
    CUDA_VISIBLE_DEVICES_VAR, DEFAULT_CONTAINER_CWD, MPI_HOOK_VAR, NO_DEV_FILES_SENTINEL,
    NVIDIA_DEFAULT_DRIVER_CAPABILITIES, NVIDIA_DRIVER_CAPABILITIES_VAR,
    NVIDIA_VISIBLE_DEVICES_VAR, SLURM_GLOBAL_SYNC_HOOK_VAR, SSH_HOOK_VAR,
};
use crate::error::{Error, ErrorKind, Result};
use crate::image::ImageMetadata;

/// Read-only view over one invocation's merge inputs.
pub struct Merger<'a> {
    command: &'a CommandRun,
    metadata: &'a ImageMetadata,
}

impl<'a> Merger<'a> {
    pub fn new(command: &'a CommandRun, metadata: &'a ImageMetadata) -> Self {
        Self { command, metadata }
    }

    /// The container working directory.
    pub fn cwd_in_container(&self) -> PathBuf {
        if let Some(workdir) = &self.command.workdir {
            return workdir.clone();
        }
        match &self.metadata.workdir {
            Some(workdir) if !workdir.as_os_str().is_empty() => workdir.clone(),
            _ => PathBuf::from(DEFAULT_CONTAINER_CWD),
        }
    }

    /// The merged container environment.
    pub fn environment_in_container(&self) -> HashMap<String, String> {
        let mut environment = self.command.host_environment.clone();
        for (key, value) in &self.metadata.env {
            environment.insert(key.clone(), value.clone());
        }

        self.apply_gpu_visibility_rules(&mut environment);

        if self.command.use_mpi {
            environment.insert(MPI_HOOK_VAR.to_string(), "1".to_string());
        }
        if self.command.enable_ssh {
            environment.insert(SSH_HOOK_VAR.to_string(), "1".to_string());
            environment.insert(SLURM_GLOBAL_SYNC_HOOK_VAR.to_string(), "1".to_string());
        }

        environment
    }

    /// The container argv.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NoCommand`] when entrypoint and cmd both end up empty.
    pub fn command_in_container(&self) -> Result<Vec<String>> {
        let entrypoint: Vec<String> = match &self.command.entrypoint {
            Some(cli_entrypoint) => cli_entrypoint.clone(),
            None => self.metadata.entry.clone().unwrap_or_default(),
        };

        let cmd: Vec<String> = if !self.command.exec_args.is_empty() {
            self.command.exec_args.clone()
        } else if self.command.entrypoint.is_some() {
            // Overriding the entrypoint discards the image cmd: the image's
            // default arguments were written for the image's entrypoint.
            Vec::new()
        } else {
            self.metadata.cmd.clone().unwrap_or_default()
        };

        let mut argv = entrypoint;
        argv.extend(cmd);
        if argv.is_empty() {
            return Err(Error::new(ErrorKind::NoCommand));
        }
        Ok(argv)
    }

    /// The admin hooks with per-hook environments merged with the
    /// invocation-wide overrides.
    pub fn hooks_in_container(&self, hooks: &OciHooks) -> OciHooks {
        OciHooks {
            prestart: self.merge_hook_list(&hooks.prestart),
            poststart: self.merge_hook_list(&hooks.poststart),
            poststop: self.merge_hook_list(&hooks.poststop),
        }
    }

    fn merge_hook_list(&self, hooks: &[OciHook]) -> Vec<OciHook> {
        hooks
            .iter()
            .map(|hook| {
                let mut hook = hook.clone();
                hook.env = merge_environment_list(&hook.env, &self.command.hooks_environment);
                hook
            })
            .collect()
    }

    fn apply_gpu_visibility_rules(&self, environment: &mut HashMap<String, String>) {
        let image_requests_gpus = self.metadata.env.contains_key(NVIDIA_VISIBLE_DEVICES_VAR);
        let host_selection = self
            .command
            .host_environment
            .get(CUDA_VISIBLE_DEVICES_VAR)
            .filter(|selection| {
                !selection.is_empty() && selection.as_str() != NO_DEV_FILES_SENTINEL
            });

        match (image_requests_gpus, host_selection) {
            (true, Some(selection)) => {
                environment.insert(
                    NVIDIA_VISIBLE_DEVICES_VAR.to_string(),
                    selection.clone(),
                );
                environment.insert(
                    CUDA_VISIBLE_DEVICES_VAR.to_string(),
                    remap_device_selection(selection),
                );
                environment
                    .entry(NVIDIA_DRIVER_CAPABILITIES_VAR.to_string())
                    .or_insert_with(|| NVIDIA_DEFAULT_DRIVER_CAPABILITIES.to_string());
            }
            _ => {
                environment.remove(CUDA_VISIBLE_DEVICES_VAR);
                environment.remove(NVIDIA_VISIBLE_DEVICES_VAR);
                environment.remove(NVIDIA_DRIVER_CAPABILITIES_VAR);
            }
        }
    }
}

/// Renumbers a host device selection from zero, keeping the host order:
/// each id becomes its rank within the ascending sort of the selection.
fn remap_device_selection(selection: &str) -> String {
    let ids: Vec<&str> = selection.split(',').collect();
    let mut sorted = ids.clone();
    sorted.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));

    ids.iter()
        .map(|id| {
            sorted
                .iter()
                .position(|candidate| candidate == id)
                .expect("id comes from the same list")
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Overlays `overrides` onto a `KEY=VALUE` environment list, keeping the
/// original entry order and appending new keys at the end.
fn merge_environment_list(
    list: &[String],
    overrides: &HashMap<String, String>,
) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(list.len() + overrides.len());
    let mut seen: Vec<&str> = Vec::new();

    for entry in list {
        let key = entry.split_once('=').map(|(key, _)| key).unwrap_or(entry);
        seen.push(key);
        match overrides.get(key) {
            Some(value) => merged.push(format!("{key}={value}")),
            None => merged.push(entry.clone()),
        }
    }

    let mut appended: Vec<(&String, &String)> = overrides
        .iter()
        .filter(|(key, _)| !seen.contains(&key.as_str()))
        .collect();
    appended.sort_by_key(|(key, _)| key.as_str());
    for (key, value) in appended {
        merged.push(format!("{key}={value}"));
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remapping_keeps_host_order() {
        assert_eq!(remap_device_selection("3,1,5"), "1,0,2");
        assert_eq!(remap_device_selection("0"), "0");
        assert_eq!(remap_device_selection("1,2"), "0,1");
    }

    #[test]
    fn environment_list_overrides_win_and_order_is_stable() {
        let overrides = HashMap::from([
            ("B".to_string(), "override".to_string()),
            ("Z".to_string(), "appended".to_string()),
        ]);
        let merged = merge_environment_list(
            &["A=1".to_string(), "B=2".to_string()],
            &overrides,
        );
        assert_eq!(merged, vec!["A=1", "B=override", "Z=appended"]);
    }
}
