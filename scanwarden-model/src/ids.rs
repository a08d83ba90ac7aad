use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Strongly typed ID for scan jobs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ScanJobId(pub Uuid);

impl Default for ScanJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanJobId {
    /// Time-ordered id so creation order survives a round trip through storage.
    pub fn new() -> Self {
        ScanJobId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl AsRef<Uuid> for ScanJobId {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ScanJobId {
    fn from(value: Uuid) -> Self {
        ScanJobId(value)
    }
}

impl FromStr for ScanJobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ScanJobId)
    }
}

impl fmt::Display for ScanJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for findings.
///
/// Derived rather than generated: the same engine alert reported for the
/// same job always maps to the same id, which is what makes repeated polls
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct FindingId(pub Uuid);

impl FindingId {
    pub fn derive(scan_job_id: ScanJobId, engine_alert_id: &str) -> Self {
        FindingId(Uuid::new_v5(
            scan_job_id.as_uuid(),
            engine_alert_id.as_bytes(),
        ))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for FindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
