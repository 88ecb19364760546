//! Line parser for board telemetry.
//!
//! Stateless functions that turn one decoded serial line into a measurement or
//! a control marker. Lines are sanitized first: everything outside printable
//! ASCII plus `\n`, `\r` and `\t` is dropped, which also strips the degree sign
//! the firmware prints (hence the `C` → `°C` canonicalization).
//!
//! | Family   | Block start | Block end        | Side channel                                    |
//! |----------|-------------|------------------|-------------------------------------------------|
//! | Standard | `new data`  | line starting `*` | none                                            |
//! | Libelium | `new data`  | next `new data`  | `Battery Level: N% \| Battery (Volts): V`       |

use crate::board::BoardFamily;
use crate::config::FamilyConfig;
use crate::sample::{BatteryReading, Measurement};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static PAIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*([A-Za-z0-9/%\-\s\(\)\.\[\]_]+?)\s*:\s*([-+]?(?:[0-9]*\.)?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*([A-Za-z°%/\.]+)?\s*$",
    )
    .expect("Invalid measurement regex")
});

static NEW_DATA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*new\s*data\s*$").expect("Invalid block-start regex"));

static BATTERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)Battery\s+Level\s*:\s*([0-9]*\.?[0-9]+)\s*%\s*\|\s*Battery\s*\(Volts\)\s*:\s*([-+]?[0-9]*\.?[0-9]+)",
    )
    .expect("Invalid battery regex")
});

/// What a sanitized line means to a board reader.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    /// Blank after sanitization
    Empty,
    /// `new data`
    BlockStart,
    /// Standard boards: a line beginning with `*`
    BlockEnd,
    /// Libelium boards: out-of-band battery status
    Battery(BatteryReading),
    /// Anything else; may or may not parse as a measurement
    Data(String),
}

/// Drop bytes outside printable ASCII (keeping `\n`, `\r`, `\t`) and trim.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| matches!(c, ' '..='~' | '\n' | '\r' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// [`sanitize`] for raw bytes straight off the wire.
pub fn sanitize_bytes(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|b| matches!(b, 0x20..=0x7E | b'\n' | b'\r' | b'\t'))
        .map(char::from)
        .collect::<String>()
        .trim()
        .to_string()
}

/// `new data`, case-insensitive.
pub fn is_block_start(line: &str) -> bool {
    NEW_DATA_RE.is_match(line)
}

/// Standard-family end marker.
pub fn is_block_end(line: &str) -> bool {
    line.trim_start().starts_with('*')
}

/// Parse a Libelium battery status line.
pub fn parse_battery(line: &str) -> Option<BatteryReading> {
    let caps = BATTERY_RE.captures(line)?;
    let percent = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let volts = caps.get(2)?.as_str().parse::<f64>().ok()?;
    Some(BatteryReading { percent, volts })
}

/// Parse `<label>: <number><optional unit>`.
///
/// Returns `None` when the line has no colon, the value is not a finite
/// number, or anything trails the unit. A lone `C` unit becomes `°C`.
pub fn parse_measurement(line: &str) -> Option<Measurement> {
    let caps = PAIR_RE.captures(line)?;
    let label = caps.get(1)?.as_str().trim();
    if label.is_empty() {
        return None;
    }
    let value = caps.get(2)?.as_str().parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    let unit = caps
        .get(3)
        .map(|u| u.as_str().trim())
        .filter(|u| !u.is_empty())
        .map(|u| if u == "C" { "°C".to_string() } else { u.to_string() });

    Some(Measurement {
        label: label.to_string(),
        value,
        unit,
    })
}

/// Classify a sanitized line according to the family's framing.
pub fn classify(family: BoardFamily, line: &str) -> LineKind {
    if line.is_empty() {
        return LineKind::Empty;
    }
    if family == BoardFamily::Libelium {
        if let Some(battery) = parse_battery(line) {
            return LineKind::Battery(battery);
        }
    }
    if is_block_start(line) {
        return LineKind::BlockStart;
    }
    if family == BoardFamily::Standard && is_block_end(line) {
        return LineKind::BlockEnd;
    }
    LineKind::Data(line.to_string())
}

/// Per-family label and unit normalization applied after parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitPolicy {
    /// Upper-case labels (Libelium gas names)
    pub uppercase_labels: bool,
    /// Unit for a unit-less line, by upper-cased label
    pub default_units: BTreeMap<String, String>,
    /// Unit for a unit-less line whose label has no entry above
    pub fallback_unit: Option<String>,
}

impl UnitPolicy {
    /// Policy derived from a family's configuration.
    pub fn for_family(family: BoardFamily, config: &FamilyConfig) -> Self {
        Self {
            uppercase_labels: family == BoardFamily::Libelium,
            default_units: config
                .default_units
                .iter()
                .map(|(label, unit)| (label.to_uppercase(), unit.clone()))
                .collect(),
            fallback_unit: config.fallback_unit.clone(),
        }
    }

    /// Unit a unit-less reading of `label` receives.
    pub fn default_unit(&self, label: &str) -> Option<String> {
        self.default_units
            .get(&label.to_uppercase())
            .cloned()
            .or_else(|| self.fallback_unit.clone())
    }

    /// Normalize one parsed measurement.
    pub fn apply(&self, mut m: Measurement) -> Measurement {
        if self.uppercase_labels {
            m.label = m.label.to_uppercase();
        }
        if m.unit.is_none() {
            m.unit = self.default_unit(&m.label);
        }
        m
    }

    /// Label as it will appear in columns.
    pub fn normalize_label(&self, label: &str) -> String {
        if self.uppercase_labels {
            label.to_uppercase()
        } else {
            label.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FamiliesConfig;

    #[test]
    fn parses_label_value_and_unit() {
        let m = parse_measurement("Gas: 3.2 ppm").unwrap();
        assert_eq!(m.label, "Gas");
        assert_eq!(m.value, 3.2);
        assert_eq!(m.unit.as_deref(), Some("ppm"));

        let m = parse_measurement("Humidity (rel): -0.5%").unwrap();
        assert_eq!(m.label, "Humidity (rel)");
        assert_eq!(m.value, -0.5);
        assert_eq!(m.unit.as_deref(), Some("%"));

        let m = parse_measurement("  MQ9_b :1.5e3 Kohms ").unwrap();
        assert_eq!(m.label, "MQ9_b");
        assert_eq!(m.value, 1500.0);
        assert_eq!(m.unit.as_deref(), Some("Kohms"));
    }

    #[test]
    fn rejects_lines_without_colon_or_number() {
        assert_eq!(parse_measurement("Temp 21.5C"), None);
        assert_eq!(parse_measurement("Temp: abc"), None);
        assert_eq!(parse_measurement("Temp: "), None);
        assert_eq!(parse_measurement(": 3.0 ppm"), None);
        assert_eq!(parse_measurement("SGP failed"), None);
        // two-value firmware lines are malformed for this protocol
        assert_eq!(parse_measurement("temperature: 24.1 C : 1.2 V"), None);
    }

    #[test]
    fn measurement_grid_round_trips() {
        let labels = ["Temp", "MQ9_b", "Humidity (rel)", "CO2", "PM2.5", "gas-1/raw"];
        let values = [0.0, 3.2, -0.5, -42.0, 0.000_000_1, 123_456.789, 1e12, -9.87e-5];
        let units = [None, Some("ppm"), Some("%"), Some("Kohms"), Some("ug/m")];
        let separators = [": ", ":", " : ", ":\t"];

        for label in labels {
            for value in values {
                for unit in units {
                    for sep in separators {
                        let tail = unit.map(|u| format!(" {u}")).unwrap_or_default();
                        let line = format!("{label}{sep}{value}{tail}");
                        let m = parse_measurement(&line).unwrap_or_else(|| panic!("rejected {line:?}"));
                        assert_eq!(m.label, label, "{line:?}");
                        assert!((m.value - value).abs() <= 1e-9, "{line:?} gave {}", m.value);
                        assert_eq!(m.unit.as_deref(), unit, "{line:?}");
                    }
                }

                assert_eq!(parse_measurement(&format!("{label} {value}")), None);
                assert_eq!(parse_measurement(&format!("{label}{value} ppm")), None);
            }

            for junk in ["abc", "NaN", "inf", "--1", "1.2.3", "ppm 3"] {
                let line = format!("{label}: {junk}");
                assert_eq!(parse_measurement(&line), None, "{line:?}");
            }
        }
    }

    #[test]
    fn lone_c_becomes_celsius() {
        let m = parse_measurement("Temp: 21.5C").unwrap();
        assert_eq!(m.unit.as_deref(), Some("°C"));
        assert_eq!(m.value, 21.5);
    }

    #[test]
    fn unitless_line_has_no_unit() {
        let m = parse_measurement("SRAW_VOC: 29871").unwrap();
        assert_eq!(m.label, "SRAW_VOC");
        assert_eq!(m.unit, None);
    }

    #[test]
    fn sanitize_strips_line_noise() {
        assert_eq!(sanitize("\u{fffd}Temp: 21.5\u{b0}C\r\n"), "Temp: 21.5C");
        assert_eq!(sanitize_bytes(b"\xff\xfeGas: 3.2 ppm\r\n"), "Gas: 3.2 ppm");
        assert_eq!(sanitize_bytes(b"\x00\x01\r\n"), "");
    }

    #[test]
    fn markers_are_case_insensitive() {
        assert!(is_block_start("new data"));
        assert!(is_block_start("  New   Data "));
        assert!(is_block_start("NEWDATA"));
        assert!(!is_block_start("new data ready"));
        assert!(is_block_end("****"));
        assert!(is_block_end("*"));
        assert!(!is_block_end("Gas: 1 *"));
    }

    #[test]
    fn battery_line_parses() {
        let b = parse_battery("Battery Level: 87% | Battery (Volts): 3.912").unwrap();
        assert_eq!(b.percent, 87.0);
        assert_eq!(b.volts, 3.912);
        assert!(parse_battery("battery level: 5 % | battery (volts): 3.1").is_some());
        assert!(parse_battery("Battery Level: high").is_none());
    }

    #[test]
    fn classify_follows_family_framing() {
        assert_eq!(classify(BoardFamily::Standard, "*"), LineKind::BlockEnd);
        assert_eq!(
            classify(BoardFamily::Libelium, "*****"),
            LineKind::Data("*****".to_string())
        );
        assert!(matches!(
            classify(
                BoardFamily::Libelium,
                "Battery Level: 50% | Battery (Volts): 3.7"
            ),
            LineKind::Battery(_)
        ));
        // Standard boards have no battery channel; the line is ordinary data
        assert!(matches!(
            classify(
                BoardFamily::Standard,
                "Battery Level: 50% | Battery (Volts): 3.7"
            ),
            LineKind::Data(_)
        ));
        assert_eq!(classify(BoardFamily::Libelium, "new data"), LineKind::BlockStart);
        assert_eq!(classify(BoardFamily::Standard, ""), LineKind::Empty);
    }

    #[test]
    fn libelium_policy_defaults_units() {
        let families = FamiliesConfig::default();
        let policy = UnitPolicy::for_family(BoardFamily::Libelium, &families.libelium);

        let o2 = policy.apply(parse_measurement("o2: 20.8").unwrap());
        assert_eq!(o2.label, "O2");
        assert_eq!(o2.unit.as_deref(), Some("%"));

        let co = policy.apply(parse_measurement("CO: 1.2").unwrap());
        assert_eq!(co.unit.as_deref(), Some("ppm"));

        let no2 = policy.apply(parse_measurement("NO2: 0.4 ppb").unwrap());
        assert_eq!(no2.unit.as_deref(), Some("ppb"));
    }

    #[test]
    fn standard_policy_keeps_labels() {
        let families = FamiliesConfig::default();
        let policy = UnitPolicy::for_family(BoardFamily::Standard, &families.standard);
        let m = policy.apply(parse_measurement("TGS2610: 0.42").unwrap());
        assert_eq!(m.label, "TGS2610");
        assert_eq!(m.unit, None);
    }
}
