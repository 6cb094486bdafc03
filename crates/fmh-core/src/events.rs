//! Event system for UI decoupling.
//!
//! Lets a front-end follow a build without being coupled to the assembler.

use std::fmt;

use crate::format::Version;

/// Assembler phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// Output erased to the fill byte.
    Prefill,
    /// Sections being resolved, placed and written.
    Sections,
    /// Whole-image checksum pass.
    ImageChecksum,
    Complete,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildPhase::Prefill => write!(f, "Prefill"),
            BuildPhase::Sections => write!(f, "Sections"),
            BuildPhase::ImageChecksum => write!(f, "Image Checksum"),
            BuildPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted while building an image.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    PhaseChanged {
        from: BuildPhase,
        to: BuildPhase,
    },
    /// A section's range was committed.
    SectionPlaced {
        name: String,
        version: Version,
        offset: u32,
        allocated_size: u32,
        payload_size: u32,
    },
    /// Explicit allocation too small; the computed minimum is used instead.
    AllocationGrown {
        name: String,
        requested: u32,
        used: u32,
    },
    /// Header written at an offset inside the first block.
    AlternateHeader { name: String, link_address: u32 },
    /// Firmware-info blob too large to store.
    FirmwareInfoDropped { size: usize },
    /// Whole-image checksum patched into the descriptor header.
    ImageChecksum { offset: u32, crc: u32 },
    /// Section progress, `current` of `total`.
    Progress { current: usize, total: usize },
    Complete,
}

/// Observer trait for receiving build events.
pub trait BuildObserver {
    fn on_event(&self, event: &BuildEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BuildObserver for NullObserver {
    fn on_event(&self, _event: &BuildEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BuildObserver for TracingObserver {
    fn on_event(&self, event: &BuildEvent) {
        match event {
            BuildEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            BuildEvent::SectionPlaced {
                name,
                version,
                offset,
                allocated_size,
                payload_size,
            } => {
                tracing::info!(
                    section = %name,
                    version = %version,
                    offset = %format!("0x{:08X}", offset),
                    alloc = %format!("0x{:X}", allocated_size),
                    size = payload_size,
                    "Section placed"
                );
            }
            BuildEvent::AllocationGrown {
                name,
                requested,
                used,
            } => {
                tracing::warn!(
                    section = %name,
                    requested = %format!("0x{:X}", requested),
                    used = %format!("0x{:X}", used),
                    "Section size exceeds the allocated size"
                );
            }
            BuildEvent::AlternateHeader { name, link_address } => {
                tracing::info!(section = %name, link = %format!("0x{:X}", link_address), "Alternate header location");
            }
            BuildEvent::FirmwareInfoDropped { size } => {
                tracing::warn!(size, "Firmware info too large, not written");
            }
            BuildEvent::ImageChecksum { offset, crc } => {
                tracing::info!(offset = %format!("0x{:08X}", offset), crc = %format!("0x{:08X}", crc), "Image checksum");
            }
            BuildEvent::Progress { current, total } => {
                tracing::debug!(current, total, "Progress");
            }
            BuildEvent::Complete => {
                tracing::info!("Build complete");
            }
        }
    }
}
