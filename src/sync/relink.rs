use crate::fingerprint::normalize_title;

/// Shortest shared title prefix, in characters, that counts as a rename.
pub const MIN_RELINK_PREFIX: usize = 4;

pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(left, right)| left == right)
        .count()
}

/// Score of `candidate` as the renamed form of `orphan`, if it qualifies.
///
/// Titles are compared normalized. One must be a prefix of the other and the
/// shared prefix must reach [`MIN_RELINK_PREFIX`].
pub fn relink_score(orphan: &str, candidate: &str) -> Option<usize> {
    let orphan = normalize_title(orphan);
    let candidate = normalize_title(candidate);
    if !(orphan.starts_with(&candidate) || candidate.starts_with(&orphan)) {
        return None;
    }
    let score = common_prefix_len(&orphan, &candidate);
    (score >= MIN_RELINK_PREFIX).then_some(score)
}

/// Position of the candidate `orphan` was most plausibly renamed to.
/// Ties and non-qualifying candidates yield `None`.
pub fn best_match<'a, I>(orphan: &str, candidates: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(usize, usize)> = None;
    let mut tied = false;
    for (position, candidate) in candidates.into_iter().enumerate() {
        let Some(score) = relink_score(orphan, candidate) else {
            continue;
        };
        match best {
            Some((_, top)) if score < top => {}
            Some((_, top)) if score == top => tied = true,
            _ => {
                best = Some((position, score));
                tied = false;
            }
        }
    }
    if tied { None } else { best.map(|(position, _)| position) }
}
