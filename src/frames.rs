//! Frame lists and the resolution of a dispatcher's frame mode into one.

use std::fmt::{self, Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::core::{Context, FRAME_RANGE_END, FRAME_RANGE_START};
use crate::error::FrameRangeError;

/// Start of the document frame range when the context doesn't carry one.
pub const DEFAULT_START: i64 = 1;
/// End of the document frame range when the context doesn't carry one.
pub const DEFAULT_END: i64 = 100;

/// An ordered list of frames.
///
/// Order is significant and duplicates are allowed, a frame list is the exact
/// sequence in which the dispatcher requests work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameList(Vec<i64>);

impl FrameList {
    pub fn new(frames: Vec<i64>) -> Self {
        Self(frames)
    }

    /// Inclusive range `start..=end`.
    pub fn range(start: i64, end: i64) -> Self {
        Self((start..=end).collect())
    }

    pub fn single(frame: i64) -> Self {
        Self(vec![frame])
    }

    pub fn into_vec(self) -> Vec<i64> {
        self.0
    }

    /// Parses a frame list expression such as `1-10x2,20,30-40!35`.
    pub fn parse(expression: &str) -> Result<Self, FrameRangeError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let mut frames = Vec::new();
        for term in trimmed.split(',') {
            frames.extend(parse_term(term.trim()).map_err(|reason| {
                FrameRangeError::new(expression, reason)
            })?);
        }

        Ok(Self(frames))
    }
}

fn parse_term(term: &str) -> Result<Vec<i64>, String> {
    if term.is_empty() {
        return Err("empty term".into());
    }

    if let Some((list, excluded)) = term.split_once('!') {
        let excluded = parse_term(excluded.trim())?;
        let frames = parse_term(list.trim())?;
        return Ok(frames
            .into_iter()
            .filter(|frame| !excluded.contains(frame))
            .collect());
    }

    if let Some(inner) = term.strip_suffix('r') {
        let mut frames = parse_term(inner)?;
        frames.reverse();
        return Ok(frames);
    }

    if let Some(inner) = term.strip_suffix('b') {
        return Ok(binary_order(&parse_term(inner)?));
    }

    parse_range(term)
}

fn parse_range(term: &str) -> Result<Vec<i64>, String> {
    let (range, step) = match term.split_once('x') {
        Some((range, step)) => {
            let step: i64 = step
                .parse()
                .map_err(|_| format!("'{step}' is not a valid step"))?;
            if step < 1 {
                return Err(format!("step must be positive, got {step}"));
            }
            (range, step)
        }
        None => (term, 1),
    };

    // A leading '-' belongs to the first number, so look for the separator after it.
    let split = range
        .char_indices()
        .skip(1)
        .find(|&(_, c)| c == '-')
        .map(|(i, _)| i);

    let Some(split) = split else {
        if step != 1 {
            return Err(format!("'{term}' has a step but no range"));
        }
        let frame = parse_frame(range)?;
        return Ok(vec![frame]);
    };

    let start = parse_frame(&range[..split])?;
    let end = parse_frame(&range[split + 1..])?;
    if start > end {
        return Err(format!("range start {start} is after its end {end}"));
    }

    Ok((start..=end).step_by(step as usize).collect())
}

fn parse_frame(text: &str) -> Result<i64, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("'{text}' is not a frame number"))
}

/// Reorders frames as first, last, then the midpoints of every remaining interval,
/// breadth first. Rendering a sequence in this order gives a useful preview early.
fn binary_order(frames: &[i64]) -> Vec<i64> {
    if frames.len() <= 2 {
        return frames.to_vec();
    }

    let mut out = vec![frames[0], frames[frames.len() - 1]];
    let mut intervals = std::collections::VecDeque::from([(0, frames.len() - 1)]);

    while let Some((lo, hi)) = intervals.pop_front() {
        if hi - lo < 2 {
            continue;
        }
        let mid = (lo + hi) / 2;
        out.push(frames[mid]);
        intervals.push_back((lo, mid));
        intervals.push_back((mid, hi));
    }

    out
}

impl Deref for FrameList {
    type Target = [i64];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<i64> for FrameList {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<i64>> for FrameList {
    fn from(value: Vec<i64>) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for FrameList {
    type Err = FrameRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Renders runs with a constant positive step compactly, `1,2,3,5,7` becomes `1-3,5-7x2`.
impl Display for FrameList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let frames = &self.0;
        let mut i = 0;
        let mut first = true;

        while i < frames.len() {
            if !first {
                f.write_str(",")?;
            }
            first = false;

            let start = frames[i];
            let mut j = i;
            let step = frames
                .get(i + 1)
                .and_then(|next| next.checked_sub(start))
                .filter(|step| *step > 0);
            if let Some(step) = step {
                while j + 1 < frames.len() && frames[j + 1].checked_sub(frames[j]) == Some(step) {
                    j += 1;
                }
                // Two frames with a big gap read better as a list.
                if j - i == 1 && step != 1 {
                    j = i;
                }
                if j > i {
                    write!(f, "{start}-{}", frames[j])?;
                    if step != 1 {
                        write!(f, "x{step}")?;
                    }
                    i = j + 1;
                    continue;
                }
            }

            write!(f, "{start}")?;
            i += 1;
        }

        Ok(())
    }
}

/// How a dispatcher picks the frames it requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramesMode {
    /// Only the frame the context is currently at.
    #[default]
    CurrentFrame,
    /// Every frame of the document range.
    FullRange,
    /// The frames described by a frame list expression.
    CustomRange,
}

/// Turns a context into the list of frames to dispatch.
///
/// The default implementation is [`FrameRange`]; alternative resolvers may
/// produce frames any way they like as long as the result is a [`FrameList`].
pub trait FrameRangeResolver: Send + Sync {
    fn frame_range(&self, context: &Context) -> Result<FrameList, FrameRangeError>;
}

/// Frame mode plus the custom expression used in [`FramesMode::CustomRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRange {
    pub mode: FramesMode,
    pub expression: String,
}

impl FrameRange {
    pub fn new(mode: FramesMode, expression: impl Into<String>) -> Self {
        Self {
            mode,
            expression: expression.into(),
        }
    }
}

impl FrameRangeResolver for FrameRange {
    fn frame_range(&self, context: &Context) -> Result<FrameList, FrameRangeError> {
        match self.mode {
            FramesMode::CurrentFrame => Ok(FrameList::single(context.frame())),
            FramesMode::FullRange => {
                let start = context.get_int(FRAME_RANGE_START).unwrap_or(DEFAULT_START);
                let end = context.get_int(FRAME_RANGE_END).unwrap_or(DEFAULT_END);
                Ok(FrameList::range(start, end))
            }
            FramesMode::CustomRange => {
                let expression = context.substitute(&self.expression);
                FrameList::parse(&expression)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FRAME;

    fn parse(expr: &str) -> Vec<i64> {
        FrameList::parse(expr).unwrap().into_vec()
    }

    #[test]
    fn test_parse_single_and_ranges() {
        assert_eq!(parse("5"), vec![5]);
        assert_eq!(parse("1-4"), vec![1, 2, 3, 4]);
        assert_eq!(parse("2-6x2"), vec![2, 4, 6]);
        assert_eq!(parse("1-100x10"), vec![1, 11, 21, 31, 41, 51, 61, 71, 81, 91]);
    }

    #[test]
    fn test_parse_preserves_request_order() {
        assert_eq!(parse("2,6,4"), vec![2, 6, 4]);
        assert_eq!(parse(" 1-2 , 10 "), vec![1, 2, 10]);
    }

    #[test]
    fn test_parse_negative_frames() {
        assert_eq!(parse("-3--1"), vec![-3, -2, -1]);
        assert_eq!(parse("-2-1"), vec![-2, -1, 0, 1]);
        assert_eq!(parse("-7"), vec![-7]);
    }

    #[test]
    fn test_parse_modifiers() {
        assert_eq!(parse("1-4r"), vec![4, 3, 2, 1]);
        assert_eq!(parse("1-10!3-5"), vec![1, 2, 6, 7, 8, 9, 10]);
        assert_eq!(parse("1-5b"), vec![1, 5, 3, 2, 4]);
    }

    #[test]
    fn test_parse_empty() {
        assert!(FrameList::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["notAFrameRange", "1-", "5-1", "1-10x0", "1-10xa", "1,,2", "3x2"] {
            let err = FrameList::parse(bad).unwrap_err();
            assert_eq!(err.expression, bad);
        }
    }

    #[test]
    fn test_display_compacts_runs() {
        assert_eq!(FrameList::new(vec![1, 2, 3, 4]).to_string(), "1-4");
        assert_eq!(FrameList::new(vec![2, 4, 6]).to_string(), "2-6x2");
        assert_eq!(FrameList::new(vec![2, 6, 4]).to_string(), "2,6,4");
        assert_eq!(FrameList::new(vec![1, 2, 3, 7]).to_string(), "1-3,7");
        assert_eq!(FrameList::new(vec![5]).to_string(), "5");
        assert_eq!(FrameList::default().to_string(), "");
        assert_eq!(
            FrameList::new(vec![i64::MIN, i64::MAX]).to_string(),
            format!("{},{}", i64::MIN, i64::MAX)
        );
        assert_eq!(
            FrameList::new(vec![-1, i64::MAX, 0]).to_string(),
            format!("-1,{},0", i64::MAX)
        );
    }

    #[test]
    fn test_display_parses_back() {
        for frames in [vec![1, 3, 5, 6, 7, 20], vec![4, 3, 2], vec![-5, -4, 10, 20, 30]] {
            let list = FrameList::new(frames);
            assert_eq!(FrameList::parse(&list.to_string()).unwrap(), list);
        }
    }

    #[test]
    fn test_current_frame() {
        let range = FrameRange::new(FramesMode::CurrentFrame, "");
        let ctx = Context::new().with(FRAME, 11);
        assert_eq!(range.frame_range(&ctx).unwrap(), FrameList::single(11));
    }

    #[test]
    fn test_full_range_reads_document_bounds() {
        let range = FrameRange::new(FramesMode::FullRange, "");
        let ctx = Context::new()
            .with(FRAME_RANGE_START, 3)
            .with(FRAME_RANGE_END, 6);
        assert_eq!(range.frame_range(&ctx).unwrap(), FrameList::range(3, 6));

        let defaults = range.frame_range(&Context::new()).unwrap();
        assert_eq!(defaults.len(), 100);
        assert_eq!(defaults.first(), Some(&1));
    }

    #[test]
    fn test_custom_range_substitutes_context() {
        let range = FrameRange::new(FramesMode::CustomRange, "${first}-6x2");
        let ctx = Context::new().with("first", 2);
        assert_eq!(range.frame_range(&ctx).unwrap().into_vec(), vec![2, 4, 6]);
    }

    #[test]
    fn test_custom_range_error() {
        let range = FrameRange::new(FramesMode::CustomRange, "notAFrameRange");
        assert!(range.frame_range(&Context::new()).is_err());
    }
}
