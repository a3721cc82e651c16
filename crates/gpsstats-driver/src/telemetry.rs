//! Telemetry snapshots and change detection
//!
//! A [`Snapshot`] condenses one [`GpsData`] reading into the figures that get
//! published. The [`Differ`] remembers the last published snapshot and only
//! lets a new one through when the satellite picture actually changed.

use gpsstats_protocol::gpsd::CONSTELLATION_COUNT;
use gpsstats_protocol::{Constellation, GpsData, Timestamp};
use tracing::trace;

/// Signal strengths at or below this are treated as "not tracked"
const MIN_TRACKED_SNR: f64 = 1.0;

/// Used satellites per constellation, indexed by gnssid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstellationCounts([u16; CONSTELLATION_COUNT]);

impl ConstellationCounts {
    pub fn get(&self, constellation: Constellation) -> u16 {
        self.0[constellation.index()]
    }

    pub fn set(&mut self, constellation: Constellation, count: u16) {
        self.0[constellation.index()] = count;
    }

    fn increment(&mut self, constellation: Constellation) {
        let slot = &mut self.0[constellation.index()];
        *slot = slot.saturating_add(1);
    }

    /// Constellations with a non-zero count, in ascending gnssid order
    pub fn non_zero(&self) -> impl Iterator<Item = (Constellation, u16)> + '_ {
        Constellation::ALL
            .iter()
            .map(|&c| (c, self.get(c)))
            .filter(|&(_, count)| count > 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub time: Timestamp,
    pub sats_used: u32,
    pub sats_visible: u32,
    /// NaN when gpsd has not reported it
    pub tdop: f64,
    pub avg_snr: f64,
    /// PPS quantization error, 0 when unknown
    pub q_err: i64,
    pub toff: Option<f64>,
    pub pps: Option<f64>,
    pub constellations: ConstellationCounts,
}

impl Snapshot {
    /// Builds a snapshot, or `None` when the reading is not publishable
    /// (no 2D/3D fix or no satellites used).
    pub fn from_reading(data: &GpsData) -> Option<Self> {
        if !data.fix_mode.has_fix() || data.satellites_used == 0 {
            return None;
        }

        let mut snr_total = 0.0;
        let mut constellations = ConstellationCounts::default();
        for sat in data.skyview.iter().filter(|sat| sat.used) {
            if sat.ss > MIN_TRACKED_SNR {
                snr_total += sat.ss;
            }
            if sat.svid == 0 {
                continue;
            }
            if let Some(constellation) =
                sat.gnssid.and_then(|id| Constellation::try_from(id).ok())
            {
                constellations.increment(constellation);
            }
        }

        Some(Self {
            time: data.fix_time,
            sats_used: data.satellites_used,
            sats_visible: data.satellites_visible,
            tdop: data.tdop,
            avg_snr: snr_total / f64::from(data.satellites_used),
            q_err: data.q_err,
            toff: data.toff,
            pps: data.pps,
            constellations,
        })
    }

    /// Compares the published figures; time and clock offsets are ignored.
    ///
    /// Floats compare exactly, so a NaN TDOP always counts as a change.
    pub fn differs_from(&self, other: &Snapshot) -> bool {
        self.sats_used != other.sats_used
            || self.sats_visible != other.sats_visible
            || self.tdop != other.tdop
            || self.avg_snr != other.avg_snr
            || self.constellations != other.constellations
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeResult {
    NoOp,
    Publish(Snapshot),
}

/// Holds the last published snapshot
#[derive(Debug, Default)]
pub struct Differ {
    last: Option<Snapshot>,
}

impl Differ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.last.as_ref()
    }

    pub fn observe(&mut self, data: &GpsData) -> ChangeResult {
        let Some(snapshot) = Snapshot::from_reading(data) else {
            trace!(fix = ?data.fix_mode, used = data.satellites_used, "reading rejected");
            return ChangeResult::NoOp;
        };

        if let Some(ref last) = self.last
            && !snapshot.differs_from(last)
        {
            return ChangeResult::NoOp;
        }

        self.last = Some(snapshot.clone());
        ChangeResult::Publish(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpsstats_protocol::{FixMode, SkySatellite};

    fn sat(gnssid: u8, svid: u16, ss: f64, used: bool) -> SkySatellite {
        SkySatellite {
            gnssid: Some(gnssid),
            svid,
            ss,
            used,
        }
    }

    fn reading() -> GpsData {
        let mut data = GpsData::new();
        data.fix_mode = FixMode::Fix3d;
        data.fix_time = Timestamp::new(1_700_000_000, 250_000_000);
        data.tdop = 1.5;
        data.skyview.extend([
            sat(0, 5, 30.0, true),
            sat(0, 7, 40.0, true),
            sat(6, 2, 20.0, true),
            sat(2, 11, 35.0, false),
        ]);
        data.satellites_visible = 4;
        data.satellites_used = 3;
        data
    }

    #[test]
    fn test_snapshot_figures() {
        let snapshot = Snapshot::from_reading(&reading()).unwrap();
        assert_eq!(snapshot.sats_used, 3);
        assert_eq!(snapshot.sats_visible, 4);
        assert_eq!(snapshot.avg_snr, 30.0);
        assert_eq!(snapshot.constellations.get(Constellation::Gps), 2);
        assert_eq!(snapshot.constellations.get(Constellation::Glonass), 1);
        assert_eq!(snapshot.constellations.get(Constellation::Galileo), 0);
    }

    #[test]
    fn test_low_snr_excluded_from_total_but_not_divisor() {
        let mut data = reading();
        data.skyview[0].ss = 1.0;
        let snapshot = Snapshot::from_reading(&data).unwrap();
        assert_eq!(snapshot.avg_snr, 20.0);
    }

    #[test]
    fn test_unknown_or_zero_ids_not_counted() {
        let mut data = reading();
        data.skyview[0].svid = 0;
        data.skyview[1].gnssid = Some(42);
        data.skyview[2].gnssid = None;
        let snapshot = Snapshot::from_reading(&data).unwrap();
        assert_eq!(snapshot.constellations, ConstellationCounts::default());
        assert_eq!(snapshot.constellations.non_zero().count(), 0);
    }

    #[test]
    fn test_rejects_without_fix_or_used_sats() {
        let mut differ = Differ::new();

        let mut data = reading();
        data.fix_mode = FixMode::NoFix;
        assert_eq!(differ.observe(&data), ChangeResult::NoOp);

        let mut data = reading();
        data.satellites_used = 0;
        assert_eq!(differ.observe(&data), ChangeResult::NoOp);

        assert!(differ.last().is_none());
    }

    #[test]
    fn test_repeat_is_noop_regardless_of_clock_fields() {
        let mut differ = Differ::new();
        assert!(matches!(differ.observe(&reading()), ChangeResult::Publish(_)));

        let mut data = reading();
        data.q_err = 17;
        data.toff = Some(0.002);
        data.pps = Some(-0.0001);
        data.fix_time = Timestamp::new(1_700_000_001, 0);
        assert_eq!(differ.observe(&data), ChangeResult::NoOp);
        assert_eq!(differ.last().unwrap().q_err, 0);
    }

    #[test]
    fn test_change_replaces_stored_snapshot() {
        let mut differ = Differ::new();
        differ.observe(&reading());

        let mut data = reading();
        data.satellites_visible = 9;
        data.q_err = -3;
        let ChangeResult::Publish(snapshot) = differ.observe(&data) else {
            panic!("visible count change must publish");
        };
        assert_eq!(snapshot.q_err, -3);
        assert_eq!(differ.last(), Some(&snapshot));
    }

    #[test]
    fn test_nan_tdop_always_changes() {
        let mut differ = Differ::new();
        let mut data = reading();
        data.tdop = f64::NAN;
        assert!(matches!(differ.observe(&data), ChangeResult::Publish(_)));
        assert!(matches!(differ.observe(&data), ChangeResult::Publish(_)));
    }

    #[test]
    fn test_rejected_reading_keeps_state() {
        let mut differ = Differ::new();
        differ.observe(&reading());
        let before = differ.last().cloned();

        let mut data = reading();
        data.satellites_used = 0;
        data.satellites_visible = 12;
        differ.observe(&data);
        assert_eq!(differ.last().cloned(), before);
    }
}
