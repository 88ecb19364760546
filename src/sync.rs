//! Row synchronization.
//!
//! A family's writer freezes a [`Header`] once, then asks the
//! [`RowSynchronizer`] for one [`OutputRow`] per tick. The synchronizer merges
//! the latest sample of every board in the family, fills absent columns with
//! null and suppresses rows that would repeat a board's timestamp.

use crate::board::BoardFamily;
use crate::config::FamilyConfig;
use crate::controller::StopSignal;
use crate::parser::UnitPolicy;
use crate::sample::{round3, ColumnKey, Sample, ROW_TIMESTAMP_FORMAT};
use crate::store::{SampleStore, StatusBoard};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// First fixed column of every file.
pub const TIMESTAMP_COLUMN: &str = "Timestamp";

/// Second fixed column of every file.
pub const FLOWRATE_COLUMN: &str = "Flowrate (L/min)";

/// Frozen data columns of one family's output files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    columns: Vec<ColumnKey>,
}

impl Header {
    /// Header over the given data columns.
    pub fn new(columns: Vec<ColumnKey>) -> Self {
        Self { columns }
    }

    /// Data columns, excluding `Timestamp` and `Flowrate (L/min)`.
    pub fn columns(&self) -> &[ColumnKey] {
        &self.columns
    }

    /// Full header record as written to the CSV files.
    pub fn record(&self) -> Vec<String> {
        [TIMESTAMP_COLUMN.to_string(), FLOWRATE_COLUMN.to_string()]
            .into_iter()
            .chain(self.columns.iter().map(ColumnKey::to_string))
            .collect()
    }
}

/// One synchronized row, positionally matching its [`Header`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    /// `YYYY-MM-DD HH:MM:SS` of the newest contributing sample
    pub timestamp: String,
    /// Session flowrate
    pub flowrate: f64,
    /// One entry per header data column; `None` is written as an empty cell
    pub values: Vec<Option<f64>>,
}

impl OutputRow {
    /// CSV record with every number rounded to three decimals.
    pub fn record(&self) -> Vec<String> {
        [self.timestamp.clone(), format_number(self.flowrate)]
            .into_iter()
            .chain(
                self.values
                    .iter()
                    .map(|v| v.map(format_number).unwrap_or_default()),
            )
            .collect()
    }
}

fn format_number(value: f64) -> String {
    let rounded = round3(value);
    // avoid writing "-0"
    if rounded == 0.0 {
        "0".to_string()
    } else {
        rounded.to_string()
    }
}

/// A row plus the samples that were new in it.
#[derive(Debug, Clone)]
pub struct SyncedRow {
    /// Row to append locally
    pub row: OutputRow,
    /// Samples of the boards that contributed fresh data, in board-id order
    pub fresh: Vec<Arc<Sample>>,
}

/// Derives a family's header from the static sensor table and observed samples.
#[derive(Debug, Clone)]
pub struct HeaderBuilder {
    family: BoardFamily,
    boards: Vec<String>,
    config: FamilyConfig,
    policy: UnitPolicy,
}

impl HeaderBuilder {
    /// Builder for the enabled `boards` of `family`.
    pub fn new(family: BoardFamily, boards: &[String], config: &FamilyConfig) -> Self {
        let mut boards = boards.to_vec();
        boards.sort();
        boards.dedup();
        Self {
            family,
            boards,
            policy: UnitPolicy::for_family(family, config),
            config: config.clone(),
        }
    }

    /// Boards covered, in id order.
    pub fn boards(&self) -> &[String] {
        &self.boards
    }

    /// Header from whatever the store holds right now.
    ///
    /// Per board: battery columns (battery families only), then the expected
    /// sensors in table order, then other observed columns sorted
    /// case-insensitively.
    pub fn build(&self, store: &SampleStore) -> Header {
        let mut columns = Vec::new();

        for board in &self.boards {
            let mut seen = BTreeSet::new();
            let mut board_columns = Vec::new();

            if self.family.has_battery() {
                board_columns.push(ColumnKey::battery_percent(board));
                board_columns.push(ColumnKey::battery_volts(board));
            }

            let expected = self
                .config
                .expected_sensors
                .get(board)
                .into_iter()
                .flatten();
            for label in expected {
                let label = self.policy.normalize_label(label);
                let unit = self.policy.default_unit(&label);
                let key = ColumnKey::labeled(board, &label, unit.as_deref());
                if seen.insert(key.clone()) {
                    board_columns.push(key);
                }
            }

            if let Some(sample) = store.get(board) {
                let mut observed: Vec<ColumnKey> = sample
                    .measurement_columns()
                    .filter(|key| !seen.contains(key))
                    .collect();
                observed.sort_by_key(|key| key.short_name().to_lowercase());
                board_columns.extend(observed);
            }

            columns.extend(board_columns);
        }

        Header::new(columns)
    }

    /// Wait up to `wait` for every board to report, then build the header as
    /// soon as at least one has.
    ///
    /// A board whose status is an error (e.g. its port failed to open) will
    /// never report, so once every other board has reported the wait ends
    /// early. Returns `None` only if `stop` fires before any board has
    /// reported.
    pub async fn wait_and_build(
        &self,
        store: &SampleStore,
        status: &StatusBoard,
        wait: Duration,
        poll: Duration,
        stop: &mut StopSignal,
    ) -> Option<Header> {
        let deadline = Instant::now() + wait;
        let settled = |board: &String| {
            store.get(board).is_some() || status.get(board).is_some_and(|s| s.is_error())
        };

        loop {
            if store.all_reporting(&self.boards) {
                break;
            }
            if store.any_reporting(&self.boards) {
                if self.boards.iter().all(settled) {
                    info!(family = %self.family, "Remaining boards failed; building from reporting boards");
                    break;
                }
                if Instant::now() >= deadline {
                    info!(family = %self.family, "Header wait elapsed; building from reporting boards");
                    break;
                }
            }
            if stop.sleep(poll).await {
                if store.any_reporting(&self.boards) {
                    break;
                }
                return None;
            }
        }

        let header = self.build(store);
        debug!(family = %self.family, columns = header.columns().len(), "Header frozen");
        Some(header)
    }
}

/// Merges the latest samples of one family's boards into rows.
#[derive(Debug)]
pub struct RowSynchronizer {
    header: Header,
    boards: Vec<String>,
    flowrate: f64,
    last_emitted: HashMap<String, String>,
}

impl RowSynchronizer {
    /// Synchronizer emitting rows under a frozen `header`.
    pub fn new(header: Header, boards: &[String], flowrate: f64) -> Self {
        let mut boards = boards.to_vec();
        boards.sort();
        boards.dedup();
        Self {
            header,
            boards,
            flowrate,
            last_emitted: HashMap::new(),
        }
    }

    /// The frozen header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Next row, or `None` when no board has a sample with a timestamp not
    /// already emitted for it.
    pub fn next_row(&mut self, store: &SampleStore) -> Option<SyncedRow> {
        let latest = store.latest_for(&self.boards);

        let fresh: Vec<Arc<Sample>> = latest
            .values()
            .filter(|sample| {
                self.last_emitted.get(&sample.board_id) != Some(&sample.formatted_timestamp())
            })
            .cloned()
            .collect();

        let newest = fresh.iter().map(|s| s.captured_at).max()?;

        for sample in &fresh {
            self.last_emitted
                .insert(sample.board_id.clone(), sample.formatted_timestamp());
        }

        let values = self
            .header
            .columns()
            .iter()
            .map(|column| latest.get(&column.board).and_then(|s| s.value_for(column)))
            .collect();

        Some(SyncedRow {
            row: OutputRow {
                timestamp: newest.format(ROW_TIMESTAMP_FORMAT).to_string(),
                flowrate: self.flowrate,
                values,
            },
            fresh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardStatus;
    use crate::config::FamiliesConfig;
    use crate::controller::StopHandle;
    use crate::sample::{BatteryReading, Measurement};
    use chrono::{DateTime, Local, TimeZone};

    fn at(sec: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, 10, 0, sec).unwrap()
    }

    fn m(label: &str, value: f64, unit: Option<&str>) -> Measurement {
        Measurement {
            label: label.into(),
            value,
            unit: unit.map(str::to_string),
        }
    }

    fn boards(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn standard_header_orders_boards_and_observed_labels() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        store.put(Sample::new(
            "B2",
            at(0),
            vec![m("gas", 3.2, Some("ppm")), m("Alpha", 1.0, None)],
            None,
        ));
        store.put(Sample::new("B1", at(0), vec![m("Temp", 21.5, Some("°C"))], None));

        let builder = HeaderBuilder::new(BoardFamily::Standard, &boards(&["B2", "B1"]), &families.standard);
        assert_eq!(
            builder.build(&store).record(),
            vec![
                "Timestamp",
                "Flowrate (L/min)",
                "B1 - Temp (°C)",
                "B2 - Alpha",
                "B2 - gas (ppm)",
            ]
        );
    }

    #[test]
    fn libelium_header_seeds_battery_and_expected_sensors() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        store.put(Sample::new(
            "LB2",
            at(0),
            vec![m("CO", 1.0, Some("ppm")), m("TEMP", 24.0, Some("°C"))],
            None,
        ));

        let builder = HeaderBuilder::new(BoardFamily::Libelium, &boards(&["LB2"]), &families.libelium);
        assert_eq!(
            builder.build(&store).record(),
            vec![
                "Timestamp",
                "Flowrate (L/min)",
                "LB2 - Battery (%)",
                "LB2 - Battery (V)",
                "LB2 - NO (ppm)",
                "LB2 - CO (ppm)",
                "LB2 - NO2 (ppm)",
                "LB2 - NH3 (ppm)",
                "LB2 - O2 (%)",
                "LB2 - TEMP (°C)",
            ]
        );
    }

    #[test]
    fn missing_board_and_label_yield_null() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        store.put(Sample::new(
            "LB1",
            at(5),
            vec![m("SO2", 0.5, Some("ppm"))],
            Some(BatteryReading {
                percent: 90.0,
                volts: 4.01,
            }),
        ));
        let ids = boards(&["LB1", "LB2"]);
        let header = HeaderBuilder::new(BoardFamily::Libelium, &ids, &families.libelium).build(&store);
        let mut sync = RowSynchronizer::new(header.clone(), &ids, 1.5);

        let synced = sync.next_row(&store).unwrap();
        assert_eq!(synced.row.values.len(), header.columns().len());
        assert_eq!(synced.row.values[0], Some(90.0));
        assert_eq!(synced.row.values[1], Some(4.01));
        assert_eq!(synced.row.values[2], Some(0.5));
        assert_eq!(synced.row.values[3], None); // LB1 - NO2
        assert!(synced.row.values[6..].iter().all(Option::is_none));
        assert_eq!(synced.row.timestamp, "2025-06-01 10:00:05");
        assert_eq!(synced.row.record()[1], "1.5");
    }

    #[test]
    fn duplicate_timestamps_are_not_reemitted() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let ids = boards(&["B1"]);
        store.put(Sample::new("B1", at(1), vec![m("Gas", 1.0, Some("ppm"))], None));
        let header = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard).build(&store);
        let mut sync = RowSynchronizer::new(header, &ids, 0.0);

        assert!(sync.next_row(&store).is_some());
        // same second, different value: still the same formatted timestamp
        store.put(Sample::new("B1", at(1), vec![m("Gas", 2.0, Some("ppm"))], None));
        assert!(sync.next_row(&store).is_none());

        store.put(Sample::new("B1", at(2), vec![m("Gas", 3.0, Some("ppm"))], None));
        let synced = sync.next_row(&store).unwrap();
        assert_eq!(synced.row.values, vec![Some(3.0)]);
    }

    #[test]
    fn row_timestamp_is_newest_fresh_contributor() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let ids = boards(&["B1", "B2"]);
        store.put(Sample::new("B1", at(3), vec![m("Temp", 20.0, Some("°C"))], None));
        store.put(Sample::new("B2", at(7), vec![m("Gas", 1.0, Some("ppm"))], None));
        let header = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard).build(&store);
        let mut sync = RowSynchronizer::new(header, &ids, 0.0);

        let first = sync.next_row(&store).unwrap();
        assert_eq!(first.row.timestamp, "2025-06-01 10:00:07");
        assert_eq!(first.fresh.len(), 2);

        // only B1 moves on; B2's older sample still fills its column
        store.put(Sample::new("B1", at(4), vec![m("Temp", 20.5, Some("°C"))], None));
        let second = sync.next_row(&store).unwrap();
        assert_eq!(second.row.timestamp, "2025-06-01 10:00:04");
        assert_eq!(second.fresh.len(), 1);
        assert_eq!(second.row.values, vec![Some(20.5), Some(1.0)]);
    }

    #[test]
    fn header_is_frozen_against_late_labels() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let status = StatusBoard::new();
        let ids = boards(&["B1", "B2"]);
        store.put(Sample::new("B1", at(1), vec![m("Temp", 20.0, Some("°C"))], None));
        let header = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard).build(&store);
        let mut sync = RowSynchronizer::new(header.clone(), &ids, 0.0);
        assert!(sync.next_row(&store).is_some());

        store.put(Sample::new(
            "B1",
            at(2),
            vec![m("Temp", 21.0, Some("°C")), m("Humidity", 40.0, Some("%"))],
            None,
        ));
        store.put(Sample::new("B2", at(2), vec![m("Gas", 3.0, Some("ppm"))], None));

        let synced = sync.next_row(&store).unwrap();
        assert_eq!(sync.header(), &header);
        assert_eq!(synced.row.values, vec![Some(21.0)]);
    }

    #[test]
    fn rounding_in_records() {
        let row = OutputRow {
            timestamp: "2025-06-01 10:00:00".into(),
            flowrate: 2.0,
            values: vec![Some(1.23456), None, Some(-0.0001)],
        };
        assert_eq!(row.record(), vec!["2025-06-01 10:00:00", "2", "1.235", "", "0"]);
    }

    #[tokio::test]
    async fn header_wait_returns_early_when_all_report() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let status = StatusBoard::new();
        let ids = boards(&["B1"]);
        store.put(Sample::new("B1", at(1), vec![m("Temp", 20.0, Some("°C"))], None));

        let handle = StopHandle::new();
        let mut stop = handle.signal();
        let builder = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard);
        let header = builder
            .wait_and_build(&store, &status, Duration::from_secs(60), Duration::from_millis(10), &mut stop)
            .await
            .unwrap();
        assert_eq!(header.columns().len(), 1);
    }

    #[tokio::test]
    async fn header_wait_gives_up_on_silent_boards() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let status = StatusBoard::new();
        let ids = boards(&["B1", "B2"]);
        store.put(Sample::new("B1", at(1), vec![m("Temp", 20.0, Some("°C"))], None));

        let handle = StopHandle::new();
        let mut stop = handle.signal();
        let builder = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard);
        let header = builder
            .wait_and_build(&store, &status, Duration::from_millis(50), Duration::from_millis(10), &mut stop)
            .await
            .unwrap();
        assert_eq!(header.record(), vec!["Timestamp", "Flowrate (L/min)", "B1 - Temp (°C)"]);
    }

    #[tokio::test]
    async fn header_wait_yields_nothing_if_stopped_before_any_report() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let status = StatusBoard::new();
        let ids = boards(&["B1"]);

        let handle = StopHandle::new();
        let mut stop = handle.signal();
        handle.stop();
        let builder = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard);
        assert!(builder
            .wait_and_build(&store, &status, Duration::from_secs(60), Duration::from_millis(10), &mut stop)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn header_wait_skips_boards_that_failed_to_open() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let status = StatusBoard::new();
        let ids = boards(&["B1", "B2"]);
        status.reset(ids.iter().cloned());
        status.set("B2", BoardStatus::OpenFailed("No such file or directory".into()));
        store.put(Sample::new("B1", at(1), vec![m("Temp", 20.0, Some("°C"))], None));

        let handle = StopHandle::new();
        let mut stop = handle.signal();
        let builder = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard);
        let header = tokio::time::timeout(
            Duration::from_secs(1),
            builder.wait_and_build(&store, &status, Duration::from_secs(600), Duration::from_millis(10), &mut stop),
        )
        .await
        .expect("header built without waiting out the deadline")
        .unwrap();
        assert_eq!(header.record(), vec!["Timestamp", "Flowrate (L/min)", "B1 - Temp (°C)"]);
    }

    #[tokio::test]
    async fn header_wait_keeps_waiting_for_healthy_silent_boards() {
        let families = FamiliesConfig::default();
        let store = SampleStore::new();
        let status = StatusBoard::new();
        let ids = boards(&["B1", "B2"]);
        status.reset(ids.iter().cloned());
        status.set("B2", BoardStatus::Listening);
        store.put(Sample::new("B1", at(1), vec![m("Temp", 20.0, Some("°C"))], None));

        let handle = StopHandle::new();
        let mut stop = handle.signal();
        let builder = HeaderBuilder::new(BoardFamily::Standard, &ids, &families.standard);
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            builder.wait_and_build(&store, &status, Duration::from_secs(600), Duration::from_millis(10), &mut stop),
        )
        .await;
        assert!(waited.is_err());
    }
}
