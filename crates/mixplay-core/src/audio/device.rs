//! Audio device enumeration
//!
//! Lists input and output devices from ALL available audio hosts (JACK,
//! ALSA, PulseAudio, CoreAudio, ...) and resolves configured [`DeviceId`]s
//! back to CPAL devices.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};
use serde::{Deserialize, Serialize};

use super::config::DeviceId;
use super::error::{AudioError, AudioResult};

/// Sample rates probed against each supported config range
const COMMON_SAMPLE_RATES: [u32; 7] = [22050, 44100, 48000, 88200, 96000, 176400, 192000];

/// Get a human-readable name for a host ID
pub(crate) fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

/// Get a host by its name string
fn get_host_by_name(name: &str) -> Option<Host> {
    cpal::available_hosts()
        .into_iter()
        .find(|id| host_name(*id) == name)
        .and_then(|id| cpal::host_from_id(id).ok())
}

/// One entry of the device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDevice {
    pub name: String,
    pub is_input: bool,
    /// Device the engine streams to/from
    pub is_selected: bool,
    pub channels: u16,
    pub current_sample_rate: u32,
    pub available_sample_rates: Vec<u32>,
    /// Host backend name (e.g., "ALSA", "JACK")
    pub device_type: String,
}

impl AudioDevice {
    pub fn id(&self) -> DeviceId {
        DeviceId::with_host(&self.name, &self.device_type)
    }
}

/// Serialize a device list as pretty JSON
pub fn device_list_json(devices: &[AudioDevice]) -> String {
    serde_json::to_string_pretty(&serde_json::json!({ "devices": devices }))
        .unwrap_or_else(|_| "{\"devices\":[]}".to_string())
}

/// Whether `name` on `host` is the device selected by `configured`
///
/// With no configured device the default host's default device is selected.
fn is_selected(configured: Option<&DeviceId>, name: &str, host: &str, default_name: Option<&str>, default_host: bool) -> bool {
    match configured {
        Some(id) => id.name == name && id.host.as_deref().map_or(true, |h| h == host),
        None => default_host && default_name == Some(name),
    }
}

/// Collect sample rates and channel counts from supported config ranges
fn describe<I>(configs: I) -> Option<(u16, Vec<u32>)>
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    let configs: Vec<_> = configs.collect();
    if configs.is_empty() {
        return None;
    }
    let mut sample_rates = Vec::new();
    let mut max_channels = 0u16;
    for config in &configs {
        max_channels = max_channels.max(config.channels());
        for rate in COMMON_SAMPLE_RATES {
            if rate >= config.min_sample_rate().0 && rate <= config.max_sample_rate().0 && !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
    }
    sample_rates.sort_unstable();
    Some((max_channels, sample_rates))
}

/// Enumerate input and output devices across all hosts
///
/// `output`/`input` are the configured devices; `current_rate` is the rate
/// of the open stream, reported for the selected devices.
pub fn enumerate_devices(output: Option<&DeviceId>, input: Option<&DeviceId>, current_rate: Option<u32>) -> Vec<AudioDevice> {
    let mut all_devices = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("Could not initialize host {:?}: {}", host_id, e);
                continue;
            }
        };
        let host_label = host_name(host_id);
        let default_host = host_id == cpal::default_host().id();

        let default_output = host.default_output_device().and_then(|d| d.name().ok());
        if let Ok(devices) = host.output_devices() {
            for device in devices {
                let Ok(name) = device.name() else { continue };
                let Some((channels, rates)) = device.supported_output_configs().ok().and_then(describe) else {
                    continue;
                };
                let selected = is_selected(output, &name, &host_label, default_output.as_deref(), default_host);
                let default_rate = device.default_output_config().map(|c| c.sample_rate().0).unwrap_or(0);
                all_devices.push(AudioDevice {
                    name,
                    is_input: false,
                    is_selected: selected,
                    channels,
                    current_sample_rate: current_rate.filter(|_| selected).unwrap_or(default_rate),
                    available_sample_rates: rates,
                    device_type: host_label.clone(),
                });
            }
        }

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                let Ok(name) = device.name() else { continue };
                let Some((channels, rates)) = device.supported_input_configs().ok().and_then(describe) else {
                    continue;
                };
                let selected = is_selected(input, &name, &host_label, default_input.as_deref(), default_host);
                let default_rate = device.default_input_config().map(|c| c.sample_rate().0).unwrap_or(0);
                all_devices.push(AudioDevice {
                    name,
                    is_input: true,
                    is_selected: selected,
                    channels,
                    current_sample_rate: current_rate.filter(|_| selected).unwrap_or(default_rate),
                    available_sample_rates: rates,
                    device_type: host_label.clone(),
                });
            }
        }
    }

    // Selected first, then outputs before inputs, then by host and name
    all_devices.sort_by(|a, b| {
        b.is_selected
            .cmp(&a.is_selected)
            .then_with(|| a.is_input.cmp(&b.is_input))
            .then_with(|| a.device_type.cmp(&b.device_type))
            .then_with(|| a.name.cmp(&b.name))
    });

    log::debug!(
        "Enumerated {} audio devices from {} hosts",
        all_devices.len(),
        cpal::available_hosts().len()
    );
    all_devices
}

/// Find an output device by its ID, or the default output
pub fn find_output_device(id: Option<&DeviceId>) -> AudioResult<cpal::Device> {
    match id {
        Some(id) => find_device(id, |host| host.output_devices().map(|d| d.collect())),
        None => cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::NoDefaultDevice("No default output device".to_string())),
    }
}

/// Find an input device by its ID, or the default input
pub fn find_input_device(id: Option<&DeviceId>) -> AudioResult<cpal::Device> {
    match id {
        Some(id) => find_device(id, |host| host.input_devices().map(|d| d.collect())),
        None => cpal::default_host()
            .default_input_device()
            .ok_or_else(|| AudioError::NoDefaultDevice("No default input device".to_string())),
    }
}

/// Search the named host, or every host when none is given
fn find_device<F>(id: &DeviceId, list: F) -> AudioResult<cpal::Device>
where
    F: Fn(&Host) -> Result<Vec<cpal::Device>, cpal::DevicesError>,
{
    let matches = |d: &cpal::Device| d.name().ok().as_deref() == Some(id.name.as_str());

    if let Some(host) = id.host.as_deref().and_then(get_host_by_name) {
        return list(&host)
            .map_err(|e| AudioError::ConfigError(e.to_string()))?
            .into_iter()
            .find(matches)
            .ok_or_else(|| AudioError::DeviceNotFound(id.display_label()));
    }

    for host_id in cpal::available_hosts() {
        if let Ok(host) = cpal::host_from_id(host_id) {
            if let Ok(devices) = list(&host) {
                if let Some(device) = devices.into_iter().find(matches) {
                    return Ok(device);
                }
            }
        }
    }
    Err(AudioError::DeviceNotFound(id.display_label()))
}
