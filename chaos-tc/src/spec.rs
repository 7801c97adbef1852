//! The impairment spec: the desired fault-injection configuration for one
//! direction of one workload, decoded from a pod annotation.

use serde::{Deserialize, Serialize};

use crate::error::{TcError, TcResult};

fn is_set(value: &str) -> bool {
    value == "yes"
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelaySpec {
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub variation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LossSpec {
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub percentage: String,
    #[serde(default)]
    pub correlation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateSpec {
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub percentage: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReorderSpec {
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub percentage: String,
    #[serde(default)]
    pub correlation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorruptSpec {
    #[serde(default)]
    pub set: String,
    #[serde(default)]
    pub percentage: String,
}

/// The JSON-encoded (legacy) form of an impairment spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImpairmentSpec {
    #[serde(default)]
    pub rate: String,
    #[serde(default)]
    pub delay: DelaySpec,
    #[serde(default)]
    pub loss: LossSpec,
    #[serde(default)]
    pub duplicate: DuplicateSpec,
    #[serde(default)]
    pub reorder: ReorderSpec,
    #[serde(default)]
    pub corrupt: CorruptSpec,
}

/// The netem impairment family, in the priority order `ExecTcChaos` applies
/// them: the first one whose `set` flag is `"yes"` wins and the rest are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaosFamily {
    Delay,
    Loss,
    Duplicate,
    Reorder,
    Corrupt,
}

/// An impairment spec after decoding, ready for [`crate::shaper::Shaper`] to
/// apply: a rate cap plus either a structured family selection (JSON form)
/// or a raw argument tail (comma-list form) to pass to `netem` verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedImpairment {
    Structured {
        rate: String,
        spec: ImpairmentSpec,
    },
    RawArgs {
        rate: String,
        args: Vec<String>,
    },
}

impl ParsedImpairment {
    /// Parses either encoding per `spec.md` §9: comma-split is attempted
    /// first unless the string looks like JSON.
    pub fn parse(raw: &str) -> TcResult<Self> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            let spec: ImpairmentSpec = serde_json::from_str(trimmed)
                .map_err(|err| TcError::BadImpairmentSpec(format!("bad impairment json: {err}")))?;
            let rate = spec.rate.clone();
            return Ok(ParsedImpairment::Structured { rate, spec });
        }

        let mut parts = trimmed.split(',');
        // The comma-list form's empty rate field is the sentinel default
        // "4gbps", asymmetric with the JSON form (spec.md §9 open question 2).
        let rate = parts.next().unwrap_or("").to_string();
        let rate = if rate.is_empty() { "4gbps".to_string() } else { rate };
        let args = parts.map(str::to_string).collect();

        Ok(ParsedImpairment::RawArgs { rate, args })
    }

    pub fn rate(&self) -> &str {
        match self {
            ParsedImpairment::Structured { rate, .. } => rate,
            ParsedImpairment::RawArgs { rate, .. } => rate,
        }
    }

    /// Selects which netem family is active (structured form) and its
    /// arguments, or the raw argument tail (comma-list form), in the
    /// priority order delay, loss, duplicate, reorder, corrupt.
    pub fn netem_args(&self) -> TcResult<Vec<String>> {
        match self {
            ParsedImpairment::RawArgs { args, .. } => {
                if args.is_empty() {
                    return Err(TcError::NoChaosSet);
                }
                Ok(args.clone())
            }
            ParsedImpairment::Structured { spec, .. } => {
                if is_set(&spec.delay.set) {
                    return Ok(vec!["delay".into(), spec.delay.time.clone(), spec.delay.variation.clone()]);
                }
                if is_set(&spec.loss.set) {
                    return Ok(vec!["loss".into(), spec.loss.percentage.clone(), spec.loss.correlation.clone()]);
                }
                if is_set(&spec.duplicate.set) {
                    return Ok(vec!["duplicate".into(), spec.duplicate.percentage.clone()]);
                }
                if is_set(&spec.reorder.set) {
                    return Ok(vec![
                        "delay".into(),
                        spec.reorder.time.clone(),
                        "reorder".into(),
                        spec.reorder.percentage.clone(),
                        spec.reorder.correlation.clone(),
                    ]);
                }
                if is_set(&spec.corrupt.set) {
                    return Ok(vec!["corrupt".into(), spec.corrupt.percentage.clone()]);
                }
                Err(TcError::NoChaosSet)
            }
        }
    }

    pub fn active_family(&self) -> Option<ChaosFamily> {
        match self {
            ParsedImpairment::RawArgs { .. } => None,
            ParsedImpairment::Structured { spec, .. } => {
                if is_set(&spec.delay.set) {
                    Some(ChaosFamily::Delay)
                } else if is_set(&spec.loss.set) {
                    Some(ChaosFamily::Loss)
                } else if is_set(&spec.duplicate.set) {
                    Some(ChaosFamily::Duplicate)
                } else if is_set(&spec.reorder.set) {
                    Some(ChaosFamily::Reorder)
                } else if is_set(&spec.corrupt.set) {
                    Some(ChaosFamily::Corrupt)
                } else {
                    None
                }
            }
        }
    }
}
