//! Scenario filter YAML files
//!
//! A scenario filter selects the training scenarios of a nuPlan run. Only two
//! of its fields matter here:
//!
//! ```yaml
//! scenario_types:
//!   - on_carpark
//!   - behind_bike
//! log_splits:
//!   train: [...]
//!   validation: [...]
//!   test: [...]
//! ```
//!
//! Filters are hand-maintained, so [`rewrite_scenario_types`] replaces the
//! `scenario_types` value textually and leaves every other line of the
//! template byte-for-byte intact (comments, `null` fields, blank lines, key
//! order). The result is parsed back and compared against the template before
//! it is returned.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::info;

pub const SCENARIO_TYPES_KEY: &str = "scenario_types";

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum FilterConfigError {
    #[display("Failed to read {}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[display("Failed to write {}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[display("Failed to parse scenario filter")]
    Parse { source: serde_yaml::Error },
    #[display("Failed to parse scenario filter {}", path.display())]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[display("Failed to encode scenario type '{scenario_type}'")]
    Encode {
        scenario_type: String,
        source: serde_yaml::Error,
    },
    #[display("Rewritten scenario filter does not match the template")]
    VerificationFailed,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSplits {
    #[serde(default, deserialize_with = "null_as_default")]
    pub train: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub validation: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub test: Vec<String>,
}

/// The fields of a scenario filter used by the analysis tools. Missing or
/// `null` fields are empty; other fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioFilterConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub scenario_types: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub log_splits: LogSplits,
}

impl ScenarioFilterConfig {
    pub fn parse(text: &str) -> Result<Self, FilterConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| FilterConfigError::Parse { source })
    }

    pub fn load_yaml(path: &Path) -> Result<Self, FilterConfigError> {
        let text = fs::read_to_string(path).map_err(|source| FilterConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).map_err(|source| FilterConfigError::ParseFile {
            path: path.to_owned(),
            source,
        })
    }
}

fn strip_newline(line: &str) -> &str {
    line.strip_suffix('\n')
        .map_or(line, |l| l.strip_suffix('\r').unwrap_or(l))
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = strip_newline(line).trim_start();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Lines belonging to a block value: indented, or a column-0 sequence entry.
fn is_block_value(line: &str) -> bool {
    let line = strip_newline(line);
    (line.starts_with([' ', '\t']) && !line.trim().is_empty()) || line.starts_with('-')
}

/// Value text after `scenario_types:` on the key line, without comments.
fn inline_value(key_line: &str) -> &str {
    let rest = &strip_newline(key_line)[SCENARIO_TYPES_KEY.len() + 1..];
    let rest = rest.trim_start();
    if rest.starts_with('#') { "" } else { rest.trim_end() }
}

fn encode_scalar(scenario_type: &str) -> Result<String, FilterConfigError> {
    let encoded =
        serde_yaml::to_string(scenario_type).map_err(|source| FilterConfigError::Encode {
            scenario_type: scenario_type.to_owned(),
            source,
        })?;
    Ok(encoded.trim_end().to_owned())
}

fn render_value<S>(
    key_line: Option<&str>,
    indent: &str,
    newline: &str,
    types: &[S],
) -> Result<String, FilterConfigError>
where
    S: AsRef<str>,
{
    if types.is_empty() {
        return Ok(format!("{SCENARIO_TYPES_KEY}: []{newline}"));
    }
    let mut out = match key_line {
        Some(line) if inline_value(line).is_empty() => format!("{}{newline}", strip_newline(line)),
        _ => format!("{SCENARIO_TYPES_KEY}:{newline}"),
    };
    for scenario_type in types {
        let scalar = encode_scalar(scenario_type.as_ref())?;
        out.push_str(&format!("{indent}- {scalar}{newline}"));
    }
    Ok(out)
}

/// Number of lines after `start` taken by the old value of the key at `start`.
fn value_extent(lines: &[&str], start: usize) -> usize {
    let inline = inline_value(lines[start]);
    if inline.starts_with('[') {
        // flow sequences may continue over several lines
        let mut depth = 0_i32;
        for (offset, line) in lines[start..].iter().enumerate() {
            let text = if offset == 0 { inline } else { strip_newline(line) };
            for c in text.chars() {
                match c {
                    '[' => depth += 1,
                    ']' => depth -= 1,
                    _ => {}
                }
            }
            if depth <= 0 {
                return offset;
            }
        }
        return lines.len() - start - 1;
    }
    if !inline.is_empty() {
        return 0;
    }

    let mut consumed = 0;
    let mut pending = 0;
    for line in &lines[start + 1..] {
        if is_block_value(line) {
            consumed += pending + 1;
            pending = 0;
        } else if is_blank_or_comment(line) {
            pending += 1;
        } else {
            break;
        }
    }
    consumed
}

/// Replaces the top-level `scenario_types` value of `template` with `types`.
///
/// Every other line is copied unchanged. When the key is absent it is
/// appended at the end.
pub fn rewrite_scenario_types<S>(template: &str, types: &[S]) -> Result<String, FilterConfigError>
where
    S: AsRef<str>,
{
    let newline = if template.contains("\r\n") { "\r\n" } else { "\n" };
    let lines = template.split_inclusive('\n').collect::<Vec<_>>();
    let key_prefix = format!("{SCENARIO_TYPES_KEY}:");
    let key_index = lines.iter().position(|line| {
        line.strip_prefix(&key_prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t', '\r', '\n']))
    });

    let mut output = String::with_capacity(template.len());
    match key_index {
        Some(start) => {
            let extent = value_extent(&lines, start);
            let indent = lines[start + 1..=start + extent]
                .iter()
                .map(|line| strip_newline(line))
                .find(|line| line.trim_start().starts_with('-'))
                .map_or("  ", |line| &line[..line.len() - line.trim_start().len()]);
            for line in &lines[..start] {
                output.push_str(line);
            }
            output.push_str(&render_value(Some(lines[start]), indent, newline, types)?);
            for line in &lines[start + extent + 1..] {
                output.push_str(line);
            }
        }
        None => {
            output.push_str(template);
            if !template.is_empty() && !template.ends_with('\n') {
                output.push_str(newline);
            }
            output.push_str(&render_value(None, "  ", newline, types)?);
        }
    }

    verify(template, &output, types)?;
    Ok(output)
}

fn parse_mapping(text: &str) -> Result<Mapping, FilterConfigError> {
    match serde_yaml::from_str::<Value>(text).map_err(|source| FilterConfigError::Parse { source })? {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(FilterConfigError::VerificationFailed),
    }
}

fn verify<S>(template: &str, output: &str, types: &[S]) -> Result<(), FilterConfigError>
where
    S: AsRef<str>,
{
    let mut expected = parse_mapping(template)?;
    let mut actual = parse_mapping(output)?;
    let key = Value::from(SCENARIO_TYPES_KEY);
    let written = actual.remove(&key);
    expected.remove(&key);

    let wanted = Value::Sequence(
        types
            .iter()
            .map(|t| Value::from(t.as_ref()))
            .collect(),
    );
    if written != Some(wanted) || expected != actual {
        return Err(FilterConfigError::VerificationFailed);
    }
    Ok(())
}

/// Writes `template` to `output` with its scenario types replaced.
pub fn write_scenario_filter<S>(
    template: &Path,
    output: &Path,
    types: &[S],
) -> Result<(), FilterConfigError>
where
    S: AsRef<str>,
{
    let text = fs::read_to_string(template).map_err(|source| FilterConfigError::Read {
        path: template.to_owned(),
        source,
    })?;
    let rewritten = rewrite_scenario_types(&text, types)?;
    fs::write(output, rewritten).map_err(|source| FilterConfigError::Write {
        path: output.to_owned(),
        source,
    })?;
    info!("Scenario filter written to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
_target_: nuplan.planning.scenario_builder.scenario_filter.ScenarioFilter
_convert_: 'all'

scenario_types:   # InD types
  - on_carpark
  - behind_bike

  - waiting_for_pedestrian_to_cross
scenario_tokens: null
log_names: ${splitter.log_splits.train}

log_splits:
  train:
    - 2021.05.12.22.00.38_veh-35_01008_01518
  validation: null
limit_total_scenarios: null   # keep all
";

    #[test]
    fn test_rewrite_preserves_other_lines() {
        let output = rewrite_scenario_types(TEMPLATE, &["high_magnitude_speed", "on_pickup_dropoff"])
            .unwrap();
        assert_eq!(
            output,
            "\
_target_: nuplan.planning.scenario_builder.scenario_filter.ScenarioFilter
_convert_: 'all'

scenario_types:   # InD types
  - high_magnitude_speed
  - on_pickup_dropoff
scenario_tokens: null
log_names: ${splitter.log_splits.train}

log_splits:
  train:
    - 2021.05.12.22.00.38_veh-35_01008_01518
  validation: null
limit_total_scenarios: null   # keep all
"
        );
        let config = ScenarioFilterConfig::parse(&output).unwrap();
        assert_eq!(config.scenario_types, ["high_magnitude_speed", "on_pickup_dropoff"]);
        assert_eq!(config.log_splits.train.len(), 1);
        assert!(config.log_splits.validation.is_empty());
        assert!(config.log_splits.test.is_empty());
    }

    #[test]
    fn test_rewrite_flow_and_null_values() {
        let template = "scenario_types: [a, b,\n  c]\nnum_scenarios_per_type: 10\n";
        assert_eq!(
            rewrite_scenario_types(template, &["x"]).unwrap(),
            "scenario_types:\n  - x\nnum_scenarios_per_type: 10\n"
        );
        let template = "scenario_types: null\nlimit: 1\n";
        assert_eq!(
            rewrite_scenario_types(template, &["x"]).unwrap(),
            "scenario_types:\n  - x\nlimit: 1\n"
        );
        assert_eq!(
            rewrite_scenario_types(template, &[] as &[&str]).unwrap(),
            "scenario_types: []\nlimit: 1\n"
        );
    }

    #[test]
    fn test_rewrite_keeps_indent_and_crlf() {
        let template = "scenario_types:\r\n    - a\r\nother: 1\r\n";
        assert_eq!(
            rewrite_scenario_types(template, &["b", "c"]).unwrap(),
            "scenario_types:\r\n    - b\r\n    - c\r\nother: 1\r\n"
        );
        let template = "scenario_types:\n- a\n- b\nother: 1\n";
        assert_eq!(
            rewrite_scenario_types(template, &["c"]).unwrap(),
            "scenario_types:\n- c\nother: 1\n"
        );
    }

    #[test]
    fn test_rewrite_appends_missing_key() {
        let template = "log_splits:\n  train: []";
        assert_eq!(
            rewrite_scenario_types(template, &["a"]).unwrap(),
            "log_splits:\n  train: []\nscenario_types:\n  - a\n"
        );
        assert_eq!(
            rewrite_scenario_types("", &["a"]).unwrap(),
            "scenario_types:\n  - a\n"
        );
    }

    #[test]
    fn test_rewrite_quotes_special_scalars() {
        let output = rewrite_scenario_types("scenario_types: []\n", &["null", "yes: no"]).unwrap();
        let config = ScenarioFilterConfig::parse(&output).unwrap();
        assert_eq!(config.scenario_types, ["null", "yes: no"]);
    }

    #[test]
    fn test_nested_key_is_not_top_level() {
        let template = "filter:\n  scenario_types:\n    - a\n";
        let output = rewrite_scenario_types(template, &["b"]).unwrap();
        assert_eq!(output, "filter:\n  scenario_types:\n    - a\nscenario_types:\n  - b\n");
    }

    #[test]
    fn test_load_and_write_files() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.yaml");
        let output = dir.path().join("resample.yaml");
        fs::write(&template, TEMPLATE).unwrap();
        write_scenario_filter(&template, &output, &["on_carpark"]).unwrap();
        let config = ScenarioFilterConfig::load_yaml(&output).unwrap();
        assert_eq!(config.scenario_types, ["on_carpark"]);
        assert!(matches!(
            ScenarioFilterConfig::load_yaml(&dir.path().join("missing.yaml")),
            Err(FilterConfigError::Read { .. })
        ));
    }
}
