//! Trial definitions: one row per trial, `index,temperature,duration,locationOrDirection`.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::protocol::SuiteMessage;

/// Illusion pattern a study runs. Fixes the meaning of the fourth trial column and the response columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IllusionKind {
    Funneling,
    Saltation,
    Motion,
    Baseline,
}

impl IllusionKind {
    /// Name sent to the device.
    pub fn name(self) -> &'static str {
        match self {
            Self::Funneling => "funneling",
            Self::Saltation => "saltation",
            Self::Motion => "motion",
            Self::Baseline => "baseline",
        }
    }

    /// Response CSV columns after `participantNumber,trialNumber`, one per Tool question.
    pub fn response_columns(self) -> &'static [&'static str] {
        match self {
            Self::Funneling => &["feltThermal", "feltLocation"],
            Self::Saltation => &["location", "thermal"],
            Self::Motion => &["feltThermal", "feltMotion", "feltDirection"],
            Self::Baseline => &["feltThermal", "feltSensation"],
        }
    }

    pub fn question_count(self) -> usize {
        self.response_columns().len()
    }
}

impl FromStr for IllusionKind {
    type Err = TrialParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "funneling" => Ok(Self::Funneling),
            "saltation" => Ok(Self::Saltation),
            "motion" => Ok(Self::Motion),
            "baseline" => Ok(Self::Baseline),
            other => Err(TrialParseError::UnknownIllusion(other.to_string())),
        }
    }
}

impl fmt::Display for IllusionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-specific factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Illusion {
    Funneling { location: f32 },
    Saltation { location: f32 },
    Motion { direction: i32 },
    Baseline,
}

impl Illusion {
    pub fn kind(&self) -> IllusionKind {
        match self {
            Self::Funneling { .. } => IllusionKind::Funneling,
            Self::Saltation { .. } => IllusionKind::Saltation,
            Self::Motion { .. } => IllusionKind::Motion,
            Self::Baseline => IllusionKind::Baseline,
        }
    }
}

/// Factors of one trial. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialFactors {
    raw: String,
    /// Offset from the base temperature, degrees.
    pub temperature: i32,
    /// Stimulus duration, seconds.
    pub duration: f32,
    pub illusion: Illusion,
}

impl TrialFactors {
    pub fn new(temperature: i32, duration: f32, illusion: Illusion) -> Self {
        let extra = match illusion {
            Illusion::Funneling { location } | Illusion::Saltation { location } => location.to_string(),
            Illusion::Motion { direction } => direction.to_string(),
            Illusion::Baseline => String::new(),
        };
        Self {
            raw: format!("0,{temperature},{duration},{extra}"),
            temperature,
            duration,
            illusion,
        }
    }

    /// Parse one trial-definition row for `kind`. The first column (index/participant) is ignored.
    pub fn parse(kind: IllusionKind, line: &str) -> Result<Self, TrialParseError> {
        let raw = line.trim_end_matches(['\r', '\n']).to_string();
        let cols: Vec<&str> = raw.split(',').map(str::trim).collect();
        let temperature = column(&cols, 1, "temperature")?;
        let duration: f32 = column(&cols, 2, "duration")?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(TrialParseError::BadNumber {
                column: "duration",
                value: cols[2].to_string(),
            });
        }
        let illusion = match kind {
            IllusionKind::Funneling => Illusion::Funneling {
                location: column(&cols, 3, "location")?,
            },
            IllusionKind::Saltation => Illusion::Saltation {
                location: column(&cols, 3, "location")?,
            },
            IllusionKind::Motion => Illusion::Motion {
                direction: column(&cols, 3, "direction")?,
            },
            IllusionKind::Baseline => Illusion::Baseline,
        };
        Ok(Self {
            raw,
            temperature,
            duration,
            illusion,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> IllusionKind {
        self.illusion.kind()
    }
}

impl fmt::Display for TrialFactors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} temperature={:+} duration={}s",
            self.kind(),
            self.temperature,
            self.duration
        )?;
        match self.illusion {
            Illusion::Funneling { location } | Illusion::Saltation { location } => {
                write!(f, " location={location}")
            }
            Illusion::Motion { direction } => write!(f, " direction={direction}"),
            Illusion::Baseline => Ok(()),
        }
    }
}

fn column<T: FromStr>(cols: &[&str], index: usize, name: &'static str) -> Result<T, TrialParseError> {
    let raw = cols
        .get(index)
        .copied()
        .filter(|s| !s.is_empty())
        .ok_or(TrialParseError::MissingColumn(name))?;
    raw.parse().map_err(|_| TrialParseError::BadNumber {
        column: name,
        value: raw.to_string(),
    })
}

/// Error parsing one trial row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrialParseError {
    #[error("missing column {0}")]
    MissingColumn(&'static str),
    #[error("column {column} is not a number: {value:?}")]
    BadNumber { column: &'static str, value: String },
    #[error("unknown illusion {0:?}")]
    UnknownIllusion(String),
}

/// Error parsing a whole trial-definition file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrialSetError {
    #[error("line {line}: {source}")]
    Row {
        line: usize,
        #[source]
        source: TrialParseError,
    },
    #[error("no trials defined")]
    Empty,
}

/// Ordered trials for one participant. Index 0 is trial 1.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSet {
    participant: u32,
    trials: Vec<TrialFactors>,
}

impl TrialSet {
    pub fn new(participant: u32, trials: Vec<TrialFactors>) -> Self {
        Self {
            participant,
            trials,
        }
    }

    /// Parse file contents: first line is a header, blank lines are skipped.
    pub fn parse(kind: IllusionKind, participant: u32, text: &str) -> Result<Self, TrialSetError> {
        let mut trials = Vec::new();
        for (i, line) in text.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let factors =
                TrialFactors::parse(kind, line).map_err(|source| TrialSetError::Row { line: i + 1, source })?;
            trials.push(factors);
        }
        if trials.is_empty() {
            return Err(TrialSetError::Empty);
        }
        Ok(Self::new(participant, trials))
    }

    pub fn participant(&self) -> u32 {
        self.participant
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TrialFactors> {
        self.trials.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrialFactors> {
        self.trials.iter()
    }
}

/// Answers collected for one trial. At most one is live per side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialResponse {
    pub participant: u32,
    pub trial: u32,
    pub responses: Vec<String>,
}

impl TrialResponse {
    pub fn new(participant: u32, trial: u32) -> Self {
        Self {
            participant,
            trial,
            responses: Vec::new(),
        }
    }

    pub fn record(&mut self, value: impl Into<String>) {
        self.responses.push(value.into());
    }

    /// Pad with "" (or truncate) to `len` answers.
    pub fn pad_to(&mut self, len: usize) {
        self.responses.resize(len, String::new());
    }

    pub fn into_report(self) -> SuiteMessage {
        SuiteMessage::Response {
            participant: self.participant,
            trial: self.trial,
            fields: self.responses,
        }
    }
}
