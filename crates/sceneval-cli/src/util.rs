use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use sceneval_stats::{comprehensive::ComprehensiveStats, histogram::Histogram};
use serde::Serialize;

const MAX_BAR_WIDTH: u64 = 50;

/// Destination of a JSON report: a file, or stdout when no path is given.
struct JsonOutput {
    writer: Box<dyn Write>,
    label: String,
}

impl JsonOutput {
    fn create(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self {
                writer: Box::new(io::stdout().lock()),
                label: "stdout".to_owned(),
            });
        };
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file: {}", path.display()))?;
        Ok(Self {
            writer: Box::new(BufWriter::new(file)),
            label: path.display().to_string(),
        })
    }

    fn write<T>(mut self, value: &T) -> anyhow::Result<()>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_writer_pretty(&mut self.writer, value)
            .with_context(|| format!("Failed to write JSON to {}", self.label))?;
        writeln!(self.writer)
            .and_then(|()| self.writer.flush())
            .with_context(|| format!("Failed to finish writing {}", self.label))
    }
}

/// Writes `value` as pretty JSON to `path`, or to stdout.
pub fn save_json<T>(value: &T, path: Option<&Path>) -> anyhow::Result<()>
where
    T: Serialize + ?Sized,
{
    JsonOutput::create(path)?.write(value)
}

/// Resolves the directory of a dataset split.
///
/// An explicit directory wins; otherwise `<data_root>/nuplan-v1.1/<split>`.
pub fn split_dir(
    explicit: Option<&Path>,
    data_root: Option<&Path>,
    split: &str,
) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_owned());
    }
    let root = data_root.context(
        "No database directory given and NUPLAN_DATA_ROOT is not set (use --db-dir or --data-root)",
    )?;
    Ok(root.join("nuplan-v1.1").join(split))
}

/// Resolves a directory under the planTF checkout.
pub fn plantf_dir(
    explicit: Option<&Path>,
    plantf: Option<&Path>,
    name: &str,
) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_owned());
    }
    let root = plantf.with_context(|| {
        format!("No {name} directory given and PLANTF is not set (use --plantf)")
    })?;
    Ok(root.join(name))
}

fn bar(count: u64, max_count: u64) -> String {
    let width = (count * MAX_BAR_WIDTH).checked_div(max_count).unwrap_or(0);
    "#".repeat(usize::try_from(width).unwrap_or(0))
}

/// Prints a horizontal bar chart, one line per label.
pub fn print_histogram<I, S>(data: I)
where
    I: IntoIterator<Item = (S, u64)>,
    S: fmt::Display,
{
    let data = data
        .into_iter()
        .map(|(label, count)| (label.to_string(), count))
        .collect::<Vec<_>>();
    let max_count = data.iter().map(|(_, c)| *c).max().unwrap_or(1);
    let label_width = data.iter().map(|(l, _)| l.len()).max().unwrap_or(0).max(15);
    for (label, count) in &data {
        println!(
            "{label:>label_width$} | {count:<7} {}",
            bar(*count, max_count)
        );
    }
}

/// Prints summary statistics and a bar chart of `values`.
///
/// Bins span `[min, max]` so that several groups printed with the same bounds
/// can be compared line by line.
pub fn print_distribution(name: &str, values: &[f64], num_bins: usize, min: f64, max: f64) {
    let Some(stats) = ComprehensiveStats::new(values.iter().copied(), &[5.0, 50.0, 95.0], num_bins)
    else {
        println!("{name}: no values");
        return;
    };
    let percentile = |p| stats.percentiles.get(p).unwrap_or(f64::NAN);
    println!(
        "{name}: n={} mean={:.4} std={:.4} P05={:.4} median={:.4} P95={:.4}",
        stats.stats.count,
        stats.stats.mean,
        stats.stats.std_dev,
        percentile(5.0),
        stats.stats.median,
        percentile(95.0),
    );
    let histogram = Histogram::with_bounds(values.iter().copied(), num_bins, min, max);
    print_histogram(
        histogram
            .bins
            .iter()
            .map(|bin| (format!("{:.3}..{:.3}", bin.range.start, bin.range.end), bin.count)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_dir() {
        assert_eq!(
            split_dir(Some(Path::new("/db")), Some(Path::new("/root")), "train").unwrap(),
            Path::new("/db")
        );
        assert_eq!(
            split_dir(None, Some(Path::new("/data")), "test").unwrap(),
            Path::new("/data/nuplan-v1.1/test")
        );
        assert!(split_dir(None, None, "train").is_err());
    }

    #[test]
    fn test_plantf_dir() {
        assert_eq!(
            plantf_dir(None, Some(Path::new("/plantf")), "encoder_features").unwrap(),
            Path::new("/plantf/encoder_features")
        );
        assert!(plantf_dir(None, None, "inference_x").is_err());
    }

    #[test]
    fn test_bar_width() {
        assert_eq!(bar(10, 10).len(), 50);
        assert_eq!(bar(5, 10).len(), 25);
        assert_eq!(bar(0, 0), "");
    }
}
