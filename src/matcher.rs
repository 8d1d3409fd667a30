//! Nearest-neighbour matching of a face descriptor against known faces.
//!
//! The scan is linear over the candidate snapshot with no indexing structure.
//! Everything here is a pure function of its arguments.

use serde::{Deserialize, Serialize};

use crate::error::MatchError;

/// Largest Euclidean distance accepted as the same person.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Display name reported when nothing matches.
pub const UNKNOWN: &str = "Unknown";

/// Something that can be matched against: an identity with a descriptor.
pub trait Candidate {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn descriptor(&self) -> &[f32];
}

impl<T: Candidate + ?Sized> Candidate for &T {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn descriptor(&self) -> &[f32] {
        (**self).descriptor()
    }
}

/// `(id, name, descriptor)` tuples, handy for ad-hoc snapshots.
impl<I, N, D> Candidate for (I, N, D)
where
    I: AsRef<str>,
    N: AsRef<str>,
    D: AsRef<[f32]>,
{
    fn id(&self) -> &str {
        self.0.as_ref()
    }

    fn name(&self) -> &str {
        self.1.as_ref()
    }

    fn descriptor(&self) -> &[f32] {
        self.2.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub id: Option<String>,
    pub name: String,
    /// Distance to the closest candidate, reported even when it is too far
    /// to match. Infinite when there were no candidates.
    pub distance: f32,
    /// 0 to 100.
    pub confidence: u8,
}

impl MatchResult {
    fn unmatched(distance: f32) -> Self {
        Self {
            matched: false,
            id: None,
            name: UNKNOWN.to_string(),
            distance,
            confidence: 0,
        }
    }

    /// Overlay label: `"<name> (<confidence>%)"`, or `"Unknown"`.
    pub fn label(&self) -> String {
        if self.matched {
            format!("{} ({}%)", self.name, self.confidence)
        } else {
            UNKNOWN.to_string()
        }
    }
}

/// Distance between two descriptors of equal length.
///
/// On a length mismatch `expected` is `a.len()`, `found` is `b.len()` and
/// `index` is always 0, since there is no candidate list to point into.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, MatchError> {
    if a.len() != b.len() {
        return Err(MatchError::DimensionMismatch {
            expected: a.len(),
            found: b.len(),
            index: 0,
        });
    }
    Ok(squared_distance(a, b).sqrt())
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Linear remap of distance onto 0..=100: 100 at distance 0, 0 at or beyond
/// `threshold`.
pub fn confidence(distance: f32, threshold: f32) -> u8 {
    if !(distance < threshold) {
        return 0;
    }
    let c = (1.0 - distance / threshold).max(0.0) * 100.0;
    c.round().clamp(0.0, 100.0) as u8
}

fn check_threshold(threshold: f32) -> Result<(), MatchError> {
    if threshold.is_finite() && threshold > 0.0 {
        Ok(())
    } else {
        Err(MatchError::InvalidInput("threshold must be a positive number"))
    }
}

fn check_query(query: &[f32]) -> Result<(), MatchError> {
    if query.is_empty() {
        return Err(MatchError::InvalidInput("empty query descriptor"));
    }
    if query.iter().any(|x| !x.is_finite()) {
        return Err(MatchError::InvalidInput("query descriptor is not finite"));
    }
    Ok(())
}

/// Find the candidate closest to `query` and decide whether it matches.
///
/// Ties go to the earliest candidate. A candidate whose descriptor length
/// differs from the query fails the whole call.
pub fn match_face<C: Candidate>(
    query: &[f32],
    candidates: &[C],
    threshold: f32,
) -> Result<MatchResult, MatchError> {
    check_query(query)?;
    check_threshold(threshold)?;

    let mut best: Option<(f32, &C)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let descriptor = candidate.descriptor();
        if descriptor.len() != query.len() {
            return Err(MatchError::DimensionMismatch {
                expected: query.len(),
                found: descriptor.len(),
                index,
            });
        }

        let distance = squared_distance(query, descriptor).sqrt();
        if distance.is_nan() {
            log::warn!("skipping candidate {}: descriptor is not finite", candidate.id());
            continue;
        }
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, candidate));
        }
    }

    let Some((distance, candidate)) = best else {
        return Ok(MatchResult::unmatched(f32::INFINITY));
    };

    if distance < threshold {
        Ok(MatchResult {
            matched: true,
            id: Some(candidate.id().to_string()),
            name: candidate.name().to_string(),
            distance,
            confidence: confidence(distance, threshold),
        })
    } else {
        Ok(MatchResult::unmatched(distance))
    }
}

/// Match every face found in one frame against the same snapshot.
pub fn match_all<Q, C>(
    queries: &[Q],
    candidates: &[C],
    threshold: f32,
) -> Result<Vec<MatchResult>, MatchError>
where
    Q: AsRef<[f32]>,
    C: Candidate,
{
    queries
        .iter()
        .map(|q| match_face(q.as_ref(), candidates, threshold))
        .collect()
}
