use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use clap;
use float_cmp::{ApproxEq, F64Margin};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use thiserror::Error;

// Value used to indicate invalid data in the .frd files. Written values
// can drift by float round-trip noise, so anything within INVALID_EPSILON
// of the sentinel is treated as missing.
const INVALID_DATA_VALUE: f64 = -999.0;
const INVALID_EPSILON: f64 = 0.1;

// First token of the column-name line that ends the metadata block.
const HEADER_MARKER: &'static str = "IX";

// Time keys are integer centiseconds: t(s) rounded to 2 decimal places,
// the alignment precision for quarter-second sounding data. If a
// deployment ever samples faster than 0.01 s this is the one constant
// to change.
const TIME_KEY_SCALE: f64 = 100.0;

// Highest 0-based column extracted from a data record (V winds). A line
// must have strictly more fields than this to be a candidate record.
const MAX_EXTRACTED_COLUMN: usize = 9;

/* Data columns of a .frd record:
   IX, t (s), P (mb), T (C), RH (%), Z (m), WD, WS (m/s), U (m/s), V (m/s), ...
   Trailing columns beyond V are not consumed. */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Parameter {
    P,
    T,
    RH,
    U,
    V,
}

#[derive(Debug)]
struct ParamSpec {
    column: usize,
    unit: &'static str,
    label: &'static str,
    threshold: f64,
}

// Indexed by Parameter discriminant.
const PARAMETERS: [ParamSpec; 5] = [
    ParamSpec { column: 2, unit: "mb", label: "Pressure", threshold: 1.0 },
    ParamSpec { column: 3, unit: "C", label: "Temperature", threshold: 0.2 },
    ParamSpec { column: 4, unit: "%", label: "Humidity", threshold: 5.0 },
    ParamSpec { column: 8, unit: "m/s", label: "U Winds", threshold: 1.0 },
    ParamSpec { column: 9, unit: "m/s", label: "V Winds", threshold: 1.0 },
];

impl Parameter {
    const ALL: [Parameter; 5] = [
        Parameter::P,
        Parameter::T,
        Parameter::RH,
        Parameter::U,
        Parameter::V,
    ];

    fn spec(self) -> &'static ParamSpec {
        return &PARAMETERS[self as usize];
    }

    fn symbol(self) -> &'static str {
        match self {
            Parameter::P => "P",
            Parameter::T => "T",
            Parameter::RH => "RH",
            Parameter::U => "U",
            Parameter::V => "V",
        }
    }

    fn from_symbol(sym: &str) -> Option<Parameter> {
        match sym {
            "P" => Some(Parameter::P),
            "T" => Some(Parameter::T),
            "RH" => Some(Parameter::RH),
            "U" => Some(Parameter::U),
            "V" => Some(Parameter::V),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
enum CompareError {
    #[error("could not load {}: {}", path.display(), source)]
    FileLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid threshold override '{0}' (expected SYM=VALUE with SYM one of P, T, RH, U, V and VALUE a non-negative number, e.g. -t T=0.5)")]
    InvalidThreshold(String),
}


// *********** //
// TIME SERIES //
// *********** //

type Reading = HashMap<Parameter, f64>;

/// The valid parameter values parsed from one file, keyed by centisecond
/// time key. Sorted key order keeps iteration deterministic.
#[derive(Debug, Default)]
struct Series {
    readings: BTreeMap<i64, Reading>,
}

impl Series {
    fn insert(&mut self, key: i64, param: Parameter, value: f64) {
        self.readings
            .entry(key)
            .or_insert_with(Reading::new)
            .insert(param, value);
    }

    fn get(&self, key: i64, param: Parameter) -> Option<f64> {
        return self.readings.get(&key).and_then(|r| r.get(&param)).copied();
    }

    fn iter(&self) -> impl Iterator<Item = (&i64, &Reading)> {
        return self.readings.iter();
    }

    fn len(&self) -> usize {
        return self.readings.len();
    }
}

fn time_key(time_s: f64) -> i64 {
    return (time_s * TIME_KEY_SCALE).round() as i64;
}


// ******* //
// PARSING //
// ******* //

fn parse_frd_file(path: &Path) -> Result<Series, CompareError> {
    let fh = File::open(path).map_err(|err| CompareError::FileLoad {
        path: path.to_path_buf(),
        source: err,
    })?;
    let reader = BufReader::new(fh);

    let mut series = Series::default();
    let mut in_data_section = false;
    let mut n_skipped: usize = 0;

    for line in reader.lines() {
        let line = line.map_err(|err| CompareError::FileLoad {
            path: path.to_path_buf(),
            source: err,
        })?;
        let parts: Vec<&str> = line.split_whitespace().collect();

        if !in_data_section {
            // Everything up to and including the column-name line is metadata
            if parts.first() == Some(&HEADER_MARKER) {
                in_data_section = true;
            }
            continue;
        }

        if !is_data_record(&parts) {
            debug!("skipping non-record line in data section: {}", line);
            n_skipped += 1;
            continue;
        }

        if store_record(&mut series, &parts).is_none() {
            debug!("skipping unparseable data line: {}", line);
            n_skipped += 1;
        }
    }

    info!(
        "parsed {} time steps from {} ({} lines skipped)",
        series.len(),
        path.display(),
        n_skipped
    );
    return Ok(series);
}

/// A candidate data record has more fields than the highest extracted
/// column and a non-negative integer record index in field 0. Secondary
/// header and separator lines inside the data section fail one of the two.
fn is_data_record(parts: &[&str]) -> bool {
    lazy_static! {
        static ref RECORD_INDEX_RE: Regex = Regex::new(r"^\d+$").unwrap();
    }
    return parts.len() > MAX_EXTRACTED_COLUMN && RECORD_INDEX_RE.is_match(parts[0]);
}

/// Store the extracted values of one accepted line. Returns None as soon
/// as any required field fails to parse; values already stored for the
/// line are kept, matching a linear last-write-wins scan.
fn store_record(series: &mut Series, parts: &[&str]) -> Option<()> {
    // Time is at field 1 and is the key for combining the two files
    let time_s = parts[1].parse::<f64>().ok()?;
    let key = time_key(time_s);

    for &param in Parameter::ALL.iter() {
        let value = parts[param.spec().column].parse::<f64>().ok()?;
        if !value.approx_eq(INVALID_DATA_VALUE, F64Margin { ulps: 2, epsilon: INVALID_EPSILON }) {
            series.insert(key, param, value);
        }
    }

    return Some(());
}


// ********** //
// COMPARISON //
// ********** //

#[derive(Debug, Clone, Copy, PartialEq)]
struct DiffStats {
    total: usize,
    mean: f64,
    min: f64,
    max: f64,
    std_dev: f64,
    within_threshold: usize,
    percent_within: f64,
}

/// Difference statistics (reference - comparison) for one parameter over
/// the time keys holding a valid value in both series. None when no such
/// key exists, which is a distinct state rather than a zeroed result.
fn compare_parameter(
    reference: &Series,
    comparison: &Series,
    param: Parameter,
    threshold: f64,
) -> Option<DiffStats> {
    let mut diffs: Vec<f64> = Vec::new();

    for (&key, reading) in reference.iter() {
        let ref_val = match reading.get(&param) {
            Some(&v) => v,
            None => continue,
        };
        let cmp_val = match comparison.get(key, param) {
            Some(v) => v,
            None => continue,
        };
        diffs.push(ref_val - cmp_val);
    }

    if diffs.is_empty() {
        return None;
    }

    let total = diffs.len();
    let mean = diffs.iter().sum::<f64>() / total as f64;
    let min = diffs.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = diffs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    // Population std dev (divide by N, not N-1) to match the reference output
    let variance = diffs.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / total as f64;
    let std_dev = variance.sqrt();
    // Threshold check is inclusive
    let within_threshold = diffs.iter().filter(|d| d.abs() <= threshold).count();
    let percent_within = within_threshold as f64 / total as f64 * 100.0;

    return Some(DiffStats {
        total,
        mean,
        min,
        max,
        std_dev,
        within_threshold,
        percent_within,
    });
}


// ********* //
// REPORTING //
// ********* //

fn format_comparison(param: Parameter, threshold: f64, stats: &Option<DiffStats>) -> String {
    let spec = param.spec();

    let stats = match stats {
        Some(s) => s,
        None => {
            return format!(
                "\nAVAPS - ACS {} ({}):\n  No comparable data points found.\n",
                spec.label, spec.unit
            );
        }
    };

    let mut out = format!("\nAVAPS - ACS {}:\n", spec.label);
    out.push_str(&format!("  Total values            : {}\n", stats.total));
    out.push_str(&format!("  Mean difference         : {:.4}\n", stats.mean));
    out.push_str(&format!(
        "  Min/Max difference      : {:.4} / {:.4}\n",
        stats.min, stats.max
    ));
    out.push_str(&format!("  Std dev                 : {:.4}\n", stats.std_dev));
    out.push_str(&format!(
        "  Threshold               : {:.2} {}\n",
        threshold, spec.unit
    ));
    out.push_str(&format!(
        "  Within threshold        : {} ({:.2}%)\n",
        stats.within_threshold, stats.percent_within
    ));
    return out;
}

fn basename(path: &Path) -> String {
    return path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
}


// ****** //
// DRIVER //
// ****** //

/// Default thresholds from the parameter table, overlaid with any
/// SYM=VALUE overrides from the command line.
fn build_thresholds(overrides: &[String]) -> Result<HashMap<Parameter, f64>, CompareError> {
    let mut thresholds: HashMap<Parameter, f64> = Parameter::ALL
        .iter()
        .map(|&p| (p, p.spec().threshold))
        .collect();

    for ov in overrides {
        let mut fields = ov.splitn(2, '=');
        let sym = fields.next().unwrap_or("");
        let value = fields.next().and_then(|v| v.parse::<f64>().ok());
        match (Parameter::from_symbol(sym), value) {
            (Some(param), Some(v)) if v >= 0.0 => {
                thresholds.insert(param, v);
            }
            _ => return Err(CompareError::InvalidThreshold(ov.clone())),
        }
    }

    return Ok(thresholds);
}

fn driver(clargs: &CmdLineArgs) -> Result<(), CompareError> {
    let thresholds = build_thresholds(&clargs.threshold_overrides)?;

    // Both files must load before any comparison; a load failure aborts
    // the run with no partial report.
    println!("Parsing File 1: {}", basename(&clargs.ref_file));
    let reference = parse_frd_file(&clargs.ref_file)?;
    println!("Parsing File 2: {}", basename(&clargs.cmp_file));
    let comparison = parse_frd_file(&clargs.cmp_file)?;

    let mut blocks = Vec::new();
    for &param in Parameter::ALL.iter() {
        let threshold = thresholds[&param];
        let stats = compare_parameter(&reference, &comparison, param, threshold);
        blocks.push(format_comparison(param, threshold, &stats));
    }

    println!("\n{} Comparison Results {}", "=".repeat(20), "=".repeat(20));
    println!(
        "Comparing: {} - {}",
        basename(&clargs.ref_file),
        basename(&clargs.cmp_file)
    );
    println!("{}", "-".repeat(58));
    for block in blocks {
        println!("{}", block);
    }
    println!("{}", "=".repeat(58));

    return Ok(());
}


// ************ //
// COMMAND LINE //
// ************ //

#[derive(Debug)]
struct CmdLineArgs {
    ref_file: PathBuf,
    cmp_file: PathBuf,
    threshold_overrides: Vec<String>,
    verbosity: i8,
}

fn parse_clargs() -> CmdLineArgs {
    let yml = clap::load_yaml!("clargs.yml");
    let clargs = clap::App::from_yaml(yml).version(clap::crate_version!()).get_matches();

    let ref_file = clargs.value_of("ref_file").unwrap();
    let cmp_file = clargs.value_of("cmp_file").unwrap();
    let threshold_overrides = clargs
        .values_of("threshold")
        .map(|vals| vals.map(String::from).collect())
        .unwrap_or_else(Vec::new);
    let nverb = clargs.occurrences_of("verbose");
    let nquiet = clargs.occurrences_of("quiet");

    let args = CmdLineArgs {
        ref_file: PathBuf::from(ref_file),
        cmp_file: PathBuf::from(cmp_file),
        threshold_overrides,
        verbosity: if nquiet > 0 { -1 } else { nverb as i8 },
    };

    return args;
}

/* Verbosity levels:

   -1 = no log output at all
    0 = warnings only
    1 = per-file parse summaries
    2 = per-line skip diagnostics
 */
fn init_logging(verbosity: i8) {
    let level = match verbosity {
        v if v < 0 => log::LevelFilter::Off,
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn main() {
    let clargs = parse_clargs();
    init_logging(clargs.verbosity);

    match driver(&clargs) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("ERROR: {}", err);
            std::process::exit(1);
        }
    }
}


// ***** //
// TESTS //
// ***** //
