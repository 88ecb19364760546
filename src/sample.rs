//! Measurement, sample and column types shared by readers, the store and the writers.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp format of output rows and of the per-board de-duplication key.
pub const ROW_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp format of remote leaf records.
pub const REMOTE_TIMESTAMP_FORMAT: &str = "%H-%M-%S %d-%m-%Y";

/// One labeled numeric reading from a board line such as `Temp: 21.5C`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Sensor name as emitted by the board (upper-cased for Libelium boards)
    pub label: String,
    /// Parsed value
    pub value: f64,
    /// Unit, if the line carried one or the family supplies a default
    pub unit: Option<String>,
}

/// Battery status reported out-of-band by Libelium boards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    /// Charge level in percent
    pub percent: f64,
    /// Battery voltage
    pub volts: f64,
}

/// The parsed result of one block from one board.
///
/// Owned by the sample store once emitted and replaced wholesale, never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Board that produced the block
    pub board_id: String,
    /// Local wall-clock time the block was finalized
    pub captured_at: DateTime<Local>,
    /// Measurements keyed by label; duplicate labels keep the last value
    pub measurements: BTreeMap<String, Measurement>,
    /// Latest known battery reading at finalization time
    pub battery: Option<BatteryReading>,
}

impl Sample {
    /// Build a sample from parsed measurements; later duplicates win.
    pub fn new(
        board_id: impl Into<String>,
        captured_at: DateTime<Local>,
        measurements: impl IntoIterator<Item = Measurement>,
        battery: Option<BatteryReading>,
    ) -> Self {
        let measurements = measurements
            .into_iter()
            .map(|m| (m.label.clone(), m))
            .collect();
        Self {
            board_id: board_id.into(),
            captured_at,
            measurements,
            battery,
        }
    }

    /// Second-precision timestamp used for rows and de-duplication.
    pub fn formatted_timestamp(&self) -> String {
        self.captured_at.format(ROW_TIMESTAMP_FORMAT).to_string()
    }

    /// Data columns this sample can fill (battery columns excluded).
    pub fn measurement_columns(&self) -> impl Iterator<Item = ColumnKey> + '_ {
        self.measurements.values().map(|m| ColumnKey::measurement(&self.board_id, m))
    }

    /// Value this sample holds for `column`, if any.
    pub fn value_for(&self, column: &ColumnKey) -> Option<f64> {
        if column.board != self.board_id {
            return None;
        }
        match &column.kind {
            ColumnKind::Measurement { label, unit } => self
                .measurements
                .get(label)
                .filter(|m| &m.unit == unit)
                .map(|m| m.value),
            ColumnKind::BatteryPercent => self.battery.map(|b| b.percent),
            ColumnKind::BatteryVolts => self.battery.map(|b| b.volts),
        }
    }
}

/// What a data column holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnKind {
    /// A labeled measurement with its unit
    Measurement {
        /// Sensor label
        label: String,
        /// Unit suffix, if any
        unit: Option<String>,
    },
    /// `<board> - Battery (%)`
    BatteryPercent,
    /// `<board> - Battery (V)`
    BatteryVolts,
}

/// A data column of an output row, owned by exactly one board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnKey {
    /// Owning board
    pub board: String,
    /// Column content
    pub kind: ColumnKind,
}

impl ColumnKey {
    /// Column for a measurement reported by `board`.
    pub fn measurement(board: &str, m: &Measurement) -> Self {
        Self::labeled(board, &m.label, m.unit.as_deref())
    }

    /// Column for `label` with an optional unit.
    pub fn labeled(board: &str, label: &str, unit: Option<&str>) -> Self {
        Self {
            board: board.to_string(),
            kind: ColumnKind::Measurement {
                label: label.to_string(),
                unit: unit.map(str::to_string),
            },
        }
    }

    /// Battery percentage column for `board`.
    pub fn battery_percent(board: &str) -> Self {
        Self {
            board: board.to_string(),
            kind: ColumnKind::BatteryPercent,
        }
    }

    /// Battery voltage column for `board`.
    pub fn battery_volts(board: &str) -> Self {
        Self {
            board: board.to_string(),
            kind: ColumnKind::BatteryVolts,
        }
    }

    /// Column name without the board prefix, e.g. `Temp (°C)`.
    pub fn short_name(&self) -> String {
        match &self.kind {
            ColumnKind::Measurement {
                label,
                unit: Some(unit),
            } => format!("{label} ({unit})"),
            ColumnKind::Measurement { label, unit: None } => label.clone(),
            ColumnKind::BatteryPercent => "Battery (%)".to_string(),
            ColumnKind::BatteryVolts => "Battery (V)".to_string(),
        }
    }

    /// True for the two battery columns.
    pub fn is_battery(&self) -> bool {
        !matches!(self.kind, ColumnKind::Measurement { .. })
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.board, self.short_name())
    }
}

/// Round to three decimal places, the precision of every written number.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
