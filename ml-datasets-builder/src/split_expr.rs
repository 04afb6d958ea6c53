//! Split expressions: `train`, `train[:10%]`, `test[-500:]`, `train[:20%]+train[40%:]`
//!
//! An expression is a union (`+`) of slices of named splits. A slice takes
//! absolute row bounds or percent bounds, either of which may be negative to
//! count from the end. Percent bounds are rounded with `(closest)` by default
//! or `(pct1_dropremainder)`, which makes every 1% block the same size.

use std::fmt;
use std::ops::{Add, Range};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::naming::is_valid_split_name;
use crate::splits::SplitRegistry;

/// Unit of slice bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Row indices
    Absolute,
    /// Percent of the split size
    Percent,
}

/// Conversion of percent bounds to rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rounding {
    /// Round `pct * n / 100` to the nearest row, ties to even
    #[default]
    Closest,
    /// `pct * (n / 100)` with integer division; needs at least 100 rows
    Pct1DropRemainder,
}

impl Rounding {
    fn name(self) -> &'static str {
        match self {
            Rounding::Closest => "closest",
            Rounding::Pct1DropRemainder => "pct1_dropremainder",
        }
    }
}

/// One slice of one split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeInstruction {
    /// Split name
    pub split: String,
    /// Start bound; the split start when absent
    pub from: Option<i64>,
    /// End bound, exclusive; the split end when absent
    pub to: Option<i64>,
    /// Unit of both bounds
    pub unit: Unit,
    /// Percent rounding
    pub rounding: Rounding,
}

/// Resolved row range of one split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteInstruction {
    /// Split name
    pub split: String,
    /// Rows of the split
    pub rows: Range<usize>,
}

/// Union of split slices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadInstruction {
    parts: Vec<RelativeInstruction>,
}

impl ReadInstruction {
    /// A whole split
    pub fn split(name: impl Into<String>) -> Self {
        Self {
            parts: vec![RelativeInstruction {
                split: name.into(),
                from: None,
                to: None,
                unit: Unit::Absolute,
                rounding: Rounding::Closest,
            }],
        }
    }

    /// Slices making up the union, in order
    pub fn parts(&self) -> &[RelativeInstruction] {
        &self.parts
    }

    /// Resolve against the sizes of built splits
    pub fn to_absolute(&self, splits: &SplitRegistry) -> Result<Vec<AbsoluteInstruction>> {
        self.parts
            .iter()
            .map(|part| {
                let num_examples = splits.require(&part.split)?.num_examples;
                let rows = part.resolve(usize::try_from(num_examples).unwrap_or(usize::MAX))?;
                Ok(AbsoluteInstruction {
                    split: part.split.clone(),
                    rows,
                })
            })
            .collect()
    }
}

impl RelativeInstruction {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    fn percent_to_rows(&self, boundary: i64, n: usize) -> Result<i64> {
        match self.rounding {
            Rounding::Closest => Ok((boundary as f64 * n as f64 / 100.0).round_ties_even() as i64),
            Rounding::Pct1DropRemainder => {
                if n < 100 {
                    return Err(Error::SplitExpression {
                        expression: self.to_string(),
                        reason: format!(
                            "pct1_dropremainder needs at least 100 examples, split has {n}"
                        ),
                    });
                }
                Ok(boundary * (n / 100) as i64)
            }
        }
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn resolve(&self, n: usize) -> Result<Range<usize>> {
        let bound = |value: Option<i64>, default: i64| -> Result<i64> {
            match (value, self.unit) {
                (None, _) => Ok(default),
                (Some(v), Unit::Absolute) => Ok(v),
                (Some(v), Unit::Percent) => self.percent_to_rows(v, n),
            }
        };
        let len = n as i64;
        let clamp = |v: i64| -> usize {
            let v = if v < 0 { (len + v).max(0) } else { v };
            v.min(len) as usize
        };

        let from = clamp(bound(self.from, 0)?);
        let to = clamp(bound(self.to, len)?);
        Ok(from..to.max(from))
    }
}

fn parse_bound(text: &str, expression: &str) -> Result<(Option<i64>, bool)> {
    let text = text.trim();
    if text.is_empty() {
        return Ok((None, false));
    }
    let (digits, percent) = match text.strip_suffix('%') {
        Some(digits) => (digits, true),
        None => (text, false),
    };
    let value = digits.parse::<i64>().map_err(|_| Error::SplitExpression {
        expression: expression.to_string(),
        reason: format!("invalid slice bound {text:?}"),
    })?;
    if percent && !(-100..=100).contains(&value) {
        return Err(Error::SplitExpression {
            expression: expression.to_string(),
            reason: format!("percent slice bound {value}% must be within [-100, 100]"),
        });
    }
    Ok((Some(value), percent))
}

impl FromStr for RelativeInstruction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let err = |reason: String| Error::SplitExpression {
            expression: s.to_string(),
            reason,
        };
        let mut rest = s.trim();

        let mut rounding = None;
        if let Some(open) = rest.rfind('(') {
            let spec = rest[open..]
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| err("unbalanced rounding parentheses".into()))?;
            rounding = Some(match spec.trim() {
                "closest" => Rounding::Closest,
                "pct1_dropremainder" => Rounding::Pct1DropRemainder,
                other => return Err(err(format!("unknown rounding {other:?}"))),
            });
            rest = rest[..open].trim_end();
        }

        let (split, slice) = match rest.find('[') {
            Some(open) => {
                let slice = rest[open..]
                    .strip_prefix('[')
                    .and_then(|r| r.strip_suffix(']'))
                    .ok_or_else(|| err("unbalanced slice brackets".into()))?;
                (rest[..open].trim(), Some(slice))
            }
            None => (rest, None),
        };
        if !is_valid_split_name(split) {
            return Err(err(format!("invalid split name {split:?}")));
        }

        let (from, to, unit) = match slice {
            None => (None, None, Unit::Absolute),
            Some(slice) => {
                let (from, to) = slice
                    .split_once(':')
                    .ok_or_else(|| err("slice must have the form [from:to]".into()))?;
                let (from, from_pct) = parse_bound(from, s)?;
                let (to, to_pct) = parse_bound(to, s)?;
                if from.is_some() && to.is_some() && from_pct != to_pct {
                    return Err(err("cannot mix percent and absolute slice bounds".into()));
                }
                let unit = if from_pct || to_pct {
                    Unit::Percent
                } else {
                    Unit::Absolute
                };
                (from, to, unit)
            }
        };

        if rounding.is_some() && unit != Unit::Percent {
            return Err(err("rounding applies to percent slices only".into()));
        }

        Ok(Self {
            split: split.to_string(),
            from,
            to,
            unit,
            rounding: rounding.unwrap_or_default(),
        })
    }
}

impl FromStr for ReadInstruction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split('+')
            .map(str::parse)
            .collect::<Result<Vec<RelativeInstruction>>>()?;
        Ok(Self { parts })
    }
}

impl fmt::Display for RelativeInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.split)?;
        if self.from.is_none() && self.to.is_none() {
            return Ok(());
        }
        let suffix = if self.unit == Unit::Percent { "%" } else { "" };
        f.write_str("[")?;
        if let Some(from) = self.from {
            write!(f, "{from}{suffix}")?;
        }
        f.write_str(":")?;
        if let Some(to) = self.to {
            write!(f, "{to}{suffix}")?;
        }
        f.write_str("]")?;
        if self.unit == Unit::Percent && self.rounding != Rounding::Closest {
            write!(f, "({})", self.rounding.name())?;
        }
        Ok(())
    }
}

impl fmt::Display for ReadInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl Add for ReadInstruction {
    type Output = ReadInstruction;

    fn add(mut self, other: ReadInstruction) -> ReadInstruction {
        self.parts.extend(other.parts);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splits::SplitInfo;
    use ml_datasets_core::ShardFileInfo;
    use test_case::test_case;

    fn registry() -> SplitRegistry {
        let split = |name: &str, rows: u64| {
            SplitInfo::from_shards(
                name,
                vec![ShardFileInfo {
                    file_name: format!("{name}.shard"),
                    num_rows: rows,
                    num_bytes: 0,
                    digest: String::new(),
                }],
            )
        };
        [split("train", 1000), split("test", 101), split("small", 10)]
            .into_iter()
            .collect()
    }

    fn resolve(expr: &str) -> Vec<(String, Range<usize>)> {
        expr.parse::<ReadInstruction>()
            .unwrap()
            .to_absolute(&registry())
            .unwrap()
            .into_iter()
            .map(|a| (a.split, a.rows))
            .collect()
    }

    #[test_case("train" => vec![("train".to_string(), 0..1000)] ; "whole split")]
    #[test_case("train[10:20]" => vec![("train".to_string(), 10..20)] ; "absolute")]
    #[test_case("train[:10%]" => vec![("train".to_string(), 0..100)] ; "percent prefix")]
    #[test_case("test[-10:]" => vec![("test".to_string(), 91..101)] ; "negative absolute")]
    #[test_case("test[:-50%]" => vec![("test".to_string(), 0..51)] ; "negative percent rounds to even")]
    #[test_case("test[:33%](pct1_dropremainder)" => vec![("test".to_string(), 0..33)] ; "drop remainder")]
    #[test_case("small[5:2]" => vec![("small".to_string(), 5..5)] ; "inverted range is empty")]
    #[test_case("small[:500]" => vec![("small".to_string(), 0..10)] ; "bounds are clamped")]
    #[test_case("train[:20%]+train[40%:]" => vec![("train".to_string(), 0..200), ("train".to_string(), 400..1000)] ; "cross validation union")]
    fn resolves(expr: &str) -> Vec<(String, Range<usize>)> {
        resolve(expr)
    }

    #[test_case("train[:101%]" ; "percent out of range")]
    #[test_case("train[1:2%]" ; "mixed units")]
    #[test_case("train[1:2](closest)" ; "rounding on absolute slice")]
    #[test_case("train[:10%](nearest)" ; "unknown rounding")]
    #[test_case("train[10]" ; "missing colon")]
    #[test_case("train[:x]" ; "non numeric bound")]
    #[test_case("tr ain" ; "invalid name")]
    #[test_case("train+" ; "dangling union")]
    fn rejects(expr: &str) {
        assert!(matches!(expr.parse::<ReadInstruction>(), Err(Error::SplitExpression { .. })));
    }

    #[test]
    fn resolution_errors() {
        let unknown = "validation".parse::<ReadInstruction>().unwrap();
        assert!(unknown.to_absolute(&registry()).is_err());

        let too_small = "small[:10%](pct1_dropremainder)".parse::<ReadInstruction>().unwrap();
        assert!(too_small.to_absolute(&registry()).is_err());
    }

    #[test]
    fn display_round_trips() {
        for expr in ["train", "train[10:20]", "test[-10%:](pct1_dropremainder)+train[:5%]"] {
            assert_eq!(expr.parse::<ReadInstruction>().unwrap().to_string(), expr);
        }
        let union = ReadInstruction::split("train") + ReadInstruction::split("test");
        assert_eq!(union.to_string(), "train+test");
    }
}
