//! Periodic inventory probe: keeps connectivity, running firmware and ONU
//! upgrade reports in the kernel's device records current. ONUs have no
//! address of their own; their records follow the parent OLT's reports.

use std::sync::Arc;

use anyhow::Result;
use tokio::time::{interval, MissedTickBehavior};

use netfleet_core::memory::UpgradeStatusBoard;
use netfleet_core::model::{ChildUpgradeReport, Connectivity, Device};
use netfleet_core::ports::{CommandError, DeviceRuntime};
use netfleet_kernel::Kernel;

use crate::ssh::SshRuntime;
use crate::tasks::{spawn_supervised, TaskHandle};

pub(crate) fn start(kernel: Kernel, runtime: Arc<SshRuntime>) -> TaskHandle {
    let every = runtime.config().probe_interval();
    spawn_supervised("inventory.probe", move || {
        let kernel = kernel.clone();
        let runtime = runtime.clone();
        async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = probe_once(&kernel, &runtime).await {
                    tracing::warn!(error = %err, "inventory probe failed");
                }
            }
        }
    })
}

async fn probe_once(kernel: &Kernel, runtime: &SshRuntime) -> Result<()> {
    let probe = runtime.config().probe_command().to_string();
    let mut devices = kernel.list_devices_async().await?;
    let mut changed = vec![false; devices.len()];
    for (device, dirty) in devices.iter_mut().zip(changed.iter_mut()) {
        if device.address.is_some() {
            let result = runtime.run_command(&device.id, &probe).await;
            *dirty |= apply_probe(device, &result);
        }
    }

    for parent_id in onu_parents(&devices, runtime.board()) {
        match runtime.onu_reports(&parent_id).await {
            Ok(reports) => {
                for idx in apply_onu_reports(&mut devices, &parent_id, reports) {
                    changed[idx] = true;
                }
            }
            Err(err) => {
                tracing::debug!(device_id = %parent_id, error = %err, "onu reports unavailable")
            }
        }
    }

    // ONUs before their parents, so a finished report never precedes the ONU's version
    let mut dirty: Vec<&Device> = devices
        .iter()
        .zip(&changed)
        .filter_map(|(device, flag)| flag.then_some(device))
        .collect();
    dirty.sort_by_key(|d| d.parent_id.is_none());
    for device in dirty {
        tracing::debug!(
            device_id = %device.id,
            connectivity = device.connectivity.as_str(),
            "device record refreshed"
        );
        kernel.upsert_device_async(device).await?;
    }
    Ok(())
}

/// Reachable devices with ONUs on record or ONU upgrades on the board.
pub(crate) fn onu_parents(devices: &[Device], board: &UpgradeStatusBoard) -> Vec<String> {
    devices
        .iter()
        .filter(|d| d.address.is_some() && !d.is_disconnected())
        .filter(|d| {
            devices
                .iter()
                .any(|c| c.parent_id.as_deref() == Some(d.id.as_str()))
                || board.children_of(&d.id).values().any(|s| s.is_live())
        })
        .map(|d| d.id.clone())
        .collect()
}

/// Fold an OLT's ONU reports into its record and into the ONU records they name.
///
/// Returns the indices of the records that changed.
pub(crate) fn apply_onu_reports(
    devices: &mut [Device],
    parent_id: &str,
    reports: Vec<ChildUpgradeReport>,
) -> Vec<usize> {
    let mut touched = Vec::new();
    for (idx, onu) in devices.iter_mut().enumerate() {
        if onu.parent_id.as_deref() != Some(parent_id) {
            continue;
        }
        let Some(report) = reports.iter().find(|r| r.child_id == onu.id) else {
            continue;
        };
        let before = (onu.connectivity, onu.firmware_version.clone());
        if let Some(version) = report
            .firmware_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            onu.firmware_version = Some(version.to_string());
        }
        if let Some(connectivity) = report.connectivity {
            onu.connectivity = connectivity;
        }
        if before != (onu.connectivity, onu.firmware_version.clone()) {
            touched.push(idx);
        }
    }
    if let Some(idx) = devices.iter().position(|d| d.id == parent_id) {
        if devices[idx].child_upgrades != reports {
            devices[idx].child_upgrades = reports;
            touched.push(idx);
        }
    }
    touched
}

/// Fold one probe result into the record; returns whether anything changed.
pub(crate) fn apply_probe(device: &mut Device, result: &Result<String, CommandError>) -> bool {
    let before = (device.connectivity, device.firmware_version.clone());
    match result {
        Ok(out) => {
            device.connectivity = Connectivity::Connected;
            if let Some(line) = out.lines().map(str::trim).find(|l| !l.is_empty()) {
                device.firmware_version = Some(line.to_string());
            }
        }
        // the device answered, the probe itself failed
        Err(CommandError::Remote { .. }) => device.connectivity = Connectivity::Connected,
        Err(_) => device.connectivity = Connectivity::Disconnected,
    }
    before != (device.connectivity, device.firmware_version.clone())
}
