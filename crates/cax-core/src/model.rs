// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run document schema and the data-location status state machine.
//!
//! A [`RunDocument`] is the shared record of one data-taking run; its `data`
//! array holds one [`DataLocation`] per physical or catalogue copy of the
//! run's data. The document is the wire format: independently deployed
//! agents read and write it concurrently with no schema negotiation, so
//! unknown fields round-trip unchanged through the flattened `extra` maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CaxError;

/// Detector a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    /// Main time projection chamber.
    Tpc,
    /// Muon veto water tank.
    MuonVeto,
}

impl Detector {
    /// Returns the string representation of the detector.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tpc => "tpc",
            Self::MuonVeto => "muon_veto",
        }
    }

    /// Parse a detector from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tpc" => Some(Self::Tpc),
            "muon_veto" => Some(Self::MuonVeto),
            _ => None,
        }
    }
}

/// Kind of data a location holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    /// Triggered raw data.
    Raw,
    /// Producer-side untriggered buffer data.
    Untriggered,
    /// Processed data, discriminated further by `pax_version`.
    Processed,
    /// Monte Carlo output.
    Mc,
}

impl LocationType {
    /// Returns the string representation of the location type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Untriggered => "untriggered",
            Self::Processed => "processed",
            Self::Mc => "mc",
        }
    }

    /// Parse a location type from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "untriggered" => Some(Self::Untriggered),
            "processed" => Some(Self::Processed),
            "mc" => Some(Self::Mc),
            _ => None,
        }
    }
}

/// Transfer status of a data location.
///
/// The state variable of the transfer state machine. Only two chains are
/// legal:
///
/// ```text
/// transferring ──► verifying ──► transferred
///      │               │
///      ▼               ▼
///    error           failed
/// ```
///
/// A location never re-enters `transferring`; a retry creates a new
/// location instead of mutating a dead one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    /// Copy announced, bytes in flight.
    Transferring,
    /// Bytes landed, checksum not yet confirmed.
    Verifying,
    /// Confirmed good copy (terminal).
    Transferred,
    /// Backend failure during copy (terminal).
    Error,
    /// Checksum mismatch after copy (terminal).
    Failed,
}

impl LocationStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Transferred => "transferred",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transferring" => Some(Self::Transferring),
            "verifying" => Some(Self::Verifying),
            "transferred" => Some(Self::Transferred),
            "error" => Some(Self::Error),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transferred | Self::Error | Self::Failed)
    }

    /// Whether the transition `self -> next` is one of the legal chains.
    pub fn can_transition_to(&self, next: LocationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Transferring, Self::Verifying)
                | (Self::Transferring, Self::Error)
                | (Self::Verifying, Self::Transferred)
                | (Self::Verifying, Self::Failed)
        )
    }
}

/// A named label on a run, used as an exclusion filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name (e.g. `donotprocess`).
    pub name: String,
    /// Who applied the tag, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// The discriminator tuple that uniquely addresses a location for updates.
///
/// Two locations of the same run must never share this key while both are
/// in a non-`error` state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey {
    /// Site/agent identifier.
    pub host: String,
    /// Kind of data.
    pub kind: LocationType,
    /// Processing-version discriminator; only meaningful for processed data.
    pub pax_version: Option<String>,
}

impl LocationKey {
    /// Whether this key addresses the given location.
    pub fn matches(&self, location: &DataLocation) -> bool {
        self.host == location.host
            && self.kind == location.kind
            && self.pax_version == location.pax_version
    }
}

/// One physical (or catalogue-registered) copy of a run's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLocation {
    /// Kind of data this copy holds.
    #[serde(rename = "type")]
    pub kind: LocationType,
    /// Site/agent that owns this copy (hostname or symbolic site name
    /// such as `rucio-catalogue` or `tsm-server`).
    pub host: String,
    /// Transfer status.
    pub status: LocationStatus,
    /// Backend-specific address: a filesystem path, grid URL, or
    /// `scope:name` for catalogue-based backends.
    pub location: String,
    /// Content hash; `None` until computed. A `transferred` location with
    /// no checksum is valid for backends that skip verification.
    pub checksum: Option<String>,
    /// When this location entity was created; staleness is measured from here.
    pub creation_time: DateTime<Utc>,
    /// Processing-version discriminator for processed data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pax_version: Option<String>,
    /// Confirmed Rucio storage elements holding this copy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rse: Vec<String>,
    /// Opaque backend-specific pass-through fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DataLocation {
    /// Create a fresh `transferring` stub announcing an intended copy.
    pub fn transferring(
        kind: LocationType,
        host: impl Into<String>,
        location: impl Into<String>,
        pax_version: Option<String>,
    ) -> Self {
        Self {
            kind,
            host: host.into(),
            status: LocationStatus::Transferring,
            location: location.into(),
            checksum: None,
            creation_time: Utc::now(),
            pax_version,
            rse: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// The discriminator key addressing this location.
    pub fn key(&self) -> LocationKey {
        LocationKey {
            host: self.host.clone(),
            kind: self.kind,
            pax_version: self.pax_version.clone(),
        }
    }

    /// Age of this location entity.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.creation_time
    }
}

/// The shared metadata record for one data-taking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDocument {
    /// Detector this run belongs to.
    pub detector: Detector,
    /// Run number; set for the main detector, absent for the muon veto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
    /// Run name; the stable identifier for both detectors, its format
    /// encodes the acquisition timestamp.
    pub name: String,
    /// Exclusion labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Data locations; grows by append, shrinks by exact-match removal.
    #[serde(default)]
    pub data: Vec<DataLocation>,
    /// Opaque descriptive metadata (trigger statistics, calibration
    /// constants) that must round-trip unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunDocument {
    /// Create a minimal run document with no locations.
    pub fn new(detector: Detector, number: Option<i64>, name: impl Into<String>) -> Self {
        Self {
            detector,
            number,
            name: name.into(),
            tags: Vec::new(),
            data: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Whether the run carries the given tag.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }

    /// The location addressed by the given key, if any.
    pub fn location(&self, key: &LocationKey) -> Option<&DataLocation> {
        self.data.iter().find(|l| key.matches(l))
    }

    /// All locations of the given kind.
    pub fn locations_of(&self, kind: LocationType) -> impl Iterator<Item = &DataLocation> {
        self.data.iter().filter(move |l| l.kind == kind)
    }

    /// Validate the document's internal invariants.
    ///
    /// The only structural rule enforceable on a single document is key
    /// uniqueness: no two non-`error` locations may share a discriminator
    /// key.
    pub fn validate(&self) -> Result<(), CaxError> {
        if self.name.is_empty() {
            return Err(CaxError::ValidationError {
                field: "name".to_string(),
                message: "run name must not be empty".to_string(),
            });
        }
        for (i, a) in self.data.iter().enumerate() {
            if a.status == LocationStatus::Error {
                continue;
            }
            let key = a.key();
            for b in self.data.iter().skip(i + 1) {
                if b.status != LocationStatus::Error && key.matches(b) {
                    return Err(CaxError::ValidationError {
                        field: "data".to_string(),
                        message: format!(
                            "duplicate non-error location for host '{}' type '{}'",
                            key.host,
                            key.kind.as_str()
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
