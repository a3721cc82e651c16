//! gpsd JSON protocol
//!
//! gpsd streams newline-delimited JSON objects, each tagged with a `class`.
//! Only the classes the bridge consumes are modelled; everything else
//! deserializes to [`Report::Other`].
//!
//! [`GpsData`] is the aggregate view over a report stream: each TPV/SKY/TOFF/PPS
//! report updates its part and leaves the rest as last seen.

use chrono::DateTime;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ProtocolError;

/// Default gpsd TCP port
pub const DEFAULT_PORT: u16 = 2947;

/// Number of known GNSS constellations (gpsd `gnssid` 0..=7)
pub const CONSTELLATION_COUNT: usize = 8;

// ============================================================================
// Constellations
// ============================================================================

/// GNSS constellation, numbered by gpsd's `gnssid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Constellation {
    Gps = 0,
    Sbas = 1,
    Galileo = 2,
    Beidou = 3,
    Imes = 4,
    Qzss = 5,
    Glonass = 6,
    Irnss = 7,
}

impl Constellation {
    /// All constellations in ascending id order
    pub const ALL: [Constellation; CONSTELLATION_COUNT] = [
        Constellation::Gps,
        Constellation::Sbas,
        Constellation::Galileo,
        Constellation::Beidou,
        Constellation::Imes,
        Constellation::Qzss,
        Constellation::Glonass,
        Constellation::Irnss,
    ];

    /// Lower-case name used in published payloads
    pub fn name(self) -> &'static str {
        match self {
            Constellation::Gps => "gps",
            Constellation::Sbas => "sbas",
            Constellation::Galileo => "galileo",
            Constellation::Beidou => "beidou",
            Constellation::Imes => "imes",
            Constellation::Qzss => "qzss",
            Constellation::Glonass => "glonass",
            Constellation::Irnss => "irnss",
        }
    }

    /// Array index of this constellation
    pub fn index(self) -> usize {
        self as usize
    }
}

// ============================================================================
// Fix mode and time
// ============================================================================

/// NMEA-style fix mode as reported in TPV `mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FixMode {
    /// No TPV seen yet (mode 0)
    #[default]
    NotSeen,
    /// Receiver reports no fix (mode 1)
    NoFix,
    /// 2D fix (mode 2)
    Fix2d,
    /// 3D fix (mode 3)
    Fix3d,
}

impl FixMode {
    pub fn from_wire(mode: u8) -> Self {
        match mode {
            1 => FixMode::NoFix,
            2 => FixMode::Fix2d,
            3 => FixMode::Fix3d,
            _ => FixMode::NotSeen,
        }
    }

    /// At least a 2D solution
    pub fn has_fix(self) -> bool {
        self >= FixMode::Fix2d
    }
}

/// Seconds and nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Parses gpsd's ISO-8601 time (`2024-05-01T12:00:00.000Z`)
    pub fn parse_iso8601(value: &str) -> Result<Self, ProtocolError> {
        let parsed =
            DateTime::parse_from_rfc3339(value).map_err(|e| ProtocolError::InvalidTime {
                value: value.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            secs: parsed.timestamp(),
            nanos: parsed.timestamp_subsec_nanos(),
        })
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + f64::from(self.nanos) / 1e9
    }
}

// ============================================================================
// Reports
// ============================================================================

/// A single gpsd report, discriminated by its `class` member
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "class")]
pub enum Report {
    #[serde(rename = "VERSION")]
    Version(Version),
    #[serde(rename = "TPV")]
    Tpv(Tpv),
    #[serde(rename = "SKY")]
    Sky(Sky),
    #[serde(rename = "TOFF")]
    Toff(ClockSample),
    #[serde(rename = "PPS")]
    Pps(ClockSample),
    #[serde(rename = "ERROR")]
    Error(ErrorReport),
    /// DEVICES, WATCH, DEVICE, ATT, ... (not consumed)
    #[serde(other)]
    Other,
}

impl Report {
    /// Parses one report line (without the trailing newline)
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(line)?)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Version {
    pub release: String,
    pub rev: String,
    pub proto_major: u32,
    pub proto_minor: u32,
}

/// Time-position-velocity report (only the members the bridge uses)
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Tpv {
    pub device: Option<String>,
    pub mode: u8,
    pub time: Option<String>,
}

/// Sky view report
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Sky {
    pub device: Option<String>,
    pub tdop: Option<f64>,
    #[serde(rename = "nSat")]
    pub n_sat: Option<u32>,
    #[serde(rename = "uSat")]
    pub u_sat: Option<u32>,
    /// Absent in DOP-only SKY reports
    pub satellites: Option<Vec<Satellite>>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Satellite {
    #[serde(rename = "PRN")]
    pub prn: i16,
    pub ss: Option<f64>,
    pub used: bool,
    pub gnssid: Option<u8>,
    pub svid: Option<u16>,
}

/// TOFF / PPS report: a receiver clock sample against the system reference
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ClockSample {
    pub device: Option<String>,
    pub real_sec: i64,
    pub real_nsec: i64,
    pub clock_sec: i64,
    pub clock_nsec: i64,
    #[serde(rename = "qErr")]
    pub q_err: Option<i64>,
}

impl ClockSample {
    /// Clock minus reference, in seconds
    pub fn offset_secs(&self) -> f64 {
        let secs = self.clock_sec - self.real_sec;
        let nsecs = self.clock_nsec - self.real_nsec;
        secs as f64 + nsecs as f64 / 1e9
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ErrorReport {
    pub message: String,
}

// ============================================================================
// WATCH command
// ============================================================================

/// `?WATCH` command body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watch<'a> {
    pub enable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pps: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<&'a str>,
}

impl<'a> Watch<'a> {
    /// JSON reports with PPS and timing, optionally limited to one device
    pub fn enable(device: Option<&'a str>) -> Self {
        Self {
            enable: true,
            json: Some(true),
            pps: Some(true),
            timing: Some(true),
            device,
        }
    }

    pub fn disable() -> Self {
        Self {
            enable: false,
            json: None,
            pps: None,
            timing: None,
            device: None,
        }
    }

    /// Renders `?WATCH={...};\n`
    pub fn to_command(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut command = b"?WATCH=".to_vec();
        serde_json::to_writer(&mut command, self)?;
        command.extend_from_slice(b";\n");
        Ok(command)
    }
}

// ============================================================================
// Aggregated view
// ============================================================================

/// One satellite of the aggregated sky view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkySatellite {
    pub gnssid: Option<u8>,
    pub svid: u16,
    /// Signal strength in dBHz (0 when not reported)
    pub ss: f64,
    pub used: bool,
}

impl From<&Satellite> for SkySatellite {
    fn from(sat: &Satellite) -> Self {
        Self {
            gnssid: sat.gnssid,
            svid: sat.svid.unwrap_or(0),
            ss: sat.ss.unwrap_or(0.0),
            used: sat.used,
        }
    }
}

/// Sky view storage; receivers rarely track more than 32 satellites
pub type Skyview = SmallVec<[SkySatellite; 32]>;

/// Aggregated receiver state built from a gpsd report stream
#[derive(Debug, Clone, PartialEq)]
pub struct GpsData {
    pub fix_mode: FixMode,
    pub fix_time: Timestamp,
    /// NaN until a SKY report carries `tdop`
    pub tdop: f64,
    pub satellites_visible: u32,
    pub satellites_used: u32,
    pub skyview: Skyview,
    /// PPS quantization error (0 when unknown)
    pub q_err: i64,
    /// Latest TOFF offset, clock minus reference (seconds)
    pub toff: Option<f64>,
    /// Latest PPS offset, clock minus reference (seconds)
    pub pps: Option<f64>,
}

impl Default for GpsData {
    fn default() -> Self {
        Self {
            fix_mode: FixMode::NotSeen,
            fix_time: Timestamp::default(),
            tdop: f64::NAN,
            satellites_visible: 0,
            satellites_used: 0,
            skyview: Skyview::new(),
            q_err: 0,
            toff: None,
            pps: None,
        }
    }
}

impl GpsData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a report into the aggregate.
    ///
    /// Returns `Ok(true)` for data-bearing reports (TPV, SKY, TOFF, PPS) and
    /// `Ok(false)` for everything else, which leaves the aggregate untouched.
    /// A TPV with an unparseable time is rejected without modifying state.
    pub fn apply(&mut self, report: &Report) -> Result<bool, ProtocolError> {
        match report {
            Report::Tpv(tpv) => {
                let time = tpv
                    .time
                    .as_deref()
                    .map(Timestamp::parse_iso8601)
                    .transpose()?;
                self.fix_mode = FixMode::from_wire(tpv.mode);
                if let Some(time) = time {
                    self.fix_time = time;
                }
                Ok(true)
            },
            Report::Sky(sky) => {
                if let Some(tdop) = sky.tdop {
                    self.tdop = tdop;
                }
                if let Some(ref satellites) = sky.satellites {
                    self.skyview = satellites.iter().map(SkySatellite::from).collect();
                    let used = self.skyview.iter().filter(|sat| sat.used).count() as u32;
                    self.satellites_visible = sky.n_sat.unwrap_or(self.skyview.len() as u32);
                    self.satellites_used = sky.u_sat.unwrap_or(used);
                }
                Ok(true)
            },
            Report::Toff(sample) => {
                self.toff = Some(sample.offset_secs());
                Ok(true)
            },
            Report::Pps(sample) => {
                self.pps = Some(sample.offset_secs());
                if let Some(q_err) = sample.q_err {
                    self.q_err = q_err;
                }
                Ok(true)
            },
            Report::Version(_) | Report::Error(_) | Report::Other => Ok(false),
        }
    }
}
