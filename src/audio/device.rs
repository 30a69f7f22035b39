//! # Audio Device Inventory
//!
//! Keeps the last enumeration of audio inputs/outputs and the user's selection.
//!
//! ## Selection rules:
//! - The first enumeration fills an empty selection with the first device of each kind
//! - A selection is never cleared by a later enumeration; if the device went away the
//!   selection is reported as stale and capture start fails with "Selected audio
//!   device not found"

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Direction of an audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Input,
    Output,
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "input" | "audioinput" | "mic" | "microphone" => Ok(DeviceKind::Input),
            "output" | "audiooutput" | "speaker" | "speakers" => Ok(DeviceKind::Output),
            _ => Err(format!("Unknown device kind: {}", s)),
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Input => f.write_str("input"),
            DeviceKind::Output => f.write_str("output"),
        }
    }
}

/// One enumerated audio device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub kind: DeviceKind,
    /// May be empty when the platform withholds labels
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, kind: DeviceKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
        }
    }

    /// Label for pickers; blank labels become "Microphone abcde" / "Speaker abcde"
    /// using the first five characters of the id.
    pub fn display_label(&self) -> String {
        if !self.label.trim().is_empty() {
            return self.label.clone();
        }
        let short: String = self.id.chars().take(5).collect();
        match self.kind {
            DeviceKind::Input => format!("Microphone {}", short),
            DeviceKind::Output => format!("Speaker {}", short),
        }
    }
}

/// Enumerated devices plus the current selection.
#[derive(Debug, Clone, Default)]
pub struct DeviceInventory {
    devices: Vec<DeviceDescriptor>,
    selected_input: Option<String>,
    selected_output: Option<String>,
}

impl DeviceInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh enumeration and fill empty selections with defaults.
    pub fn update(&mut self, devices: Vec<DeviceDescriptor>) {
        self.devices = devices;

        for kind in [DeviceKind::Input, DeviceKind::Output] {
            if self.selected(kind).is_some() {
                if self.is_stale(kind) {
                    warn!(kind = %kind, "Selected audio device is no longer present");
                }
                continue;
            }
            if let Some(first) = self.devices.iter().find(|d| d.kind == kind) {
                debug!(kind = %kind, device = %first.id, "Defaulting to first enumerated device");
                let id = first.id.clone();
                self.set_selected(kind, Some(id));
            }
        }
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn of_kind(&self, kind: DeviceKind) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter().filter(move |d| d.kind == kind)
    }

    pub fn find(&self, kind: DeviceKind, id: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.kind == kind && d.id == id)
    }

    pub fn selected(&self, kind: DeviceKind) -> Option<&str> {
        match kind {
            DeviceKind::Input => self.selected_input.as_deref(),
            DeviceKind::Output => self.selected_output.as_deref(),
        }
    }

    /// The selected device, if it is part of the last enumeration.
    pub fn selected_device(&self, kind: DeviceKind) -> Option<&DeviceDescriptor> {
        self.selected(kind).and_then(|id| self.find(kind, id))
    }

    /// Select a device by id. Unknown ids are accepted and reported as stale.
    pub fn select(&mut self, kind: DeviceKind, id: impl Into<String>) {
        self.set_selected(kind, Some(id.into()));
    }

    /// A selection exists but the device is missing from the last enumeration.
    pub fn is_stale(&self, kind: DeviceKind) -> bool {
        self.selected(kind).is_some() && self.selected_device(kind).is_none()
    }

    fn set_selected(&mut self, kind: DeviceKind, id: Option<String>) {
        match kind {
            DeviceKind::Input => self.selected_input = id,
            DeviceKind::Output => self.selected_output = id,
        }
    }
}
