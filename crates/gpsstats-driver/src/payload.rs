//! JSON payload of a published snapshot
//!
//! ```text
//! {"time":1700000000.25,"sats_used":9,"sats_visible":14,"tdop":0.91,"avg_snr":33.4,
//!  "qErr":-12,"toff":0.000125,"pps":-0.0000021,"sats.gps":6,"sats.glonass":3}
//! ```
//!
//! Keys appear in this fixed order. `qErr` is omitted when zero; `toff` and
//! `pps` are always present (0 when unknown). Per-constellation keys are only
//! emitted for non-zero counts. A NaN TDOP is written as `null`.

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

use crate::telemetry::Snapshot;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

struct Payload<'a>(&'a Snapshot);

impl Serialize for Payload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("time", &snapshot.time.as_secs_f64())?;
        map.serialize_entry("sats_used", &snapshot.sats_used)?;
        map.serialize_entry("sats_visible", &snapshot.sats_visible)?;
        // serde_json writes non-finite floats as null
        map.serialize_entry("tdop", &snapshot.tdop)?;
        map.serialize_entry("avg_snr", &snapshot.avg_snr)?;
        if snapshot.q_err != 0 {
            map.serialize_entry("qErr", &snapshot.q_err)?;
        }
        map.serialize_entry("toff", &snapshot.toff.unwrap_or(0.0))?;
        map.serialize_entry("pps", &snapshot.pps.unwrap_or(0.0))?;
        for (constellation, count) in snapshot.constellations.non_zero() {
            map.serialize_entry(&format!("sats.{}", constellation.name()), &count)?;
        }
        map.end()
    }
}

/// Renders `snapshot` as a single-line JSON object
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(&Payload(snapshot))?)
}
