use crate::{IndexAllocator, OrderingError};

/// Index produced for the first item of an empty collection.
pub const CANONICAL_START_INDEX: &str = "a";

const DIGITS: &[u8; 52] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LOWEST_DIGIT: char = 'A';
const START_DIGIT: char = 'a';

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("lower bound {before:?} is not below upper bound {after:?}")]
    InvertedBounds { before: String, after: String },
    #[error("no index sorts below {after:?}")]
    NoRoom { after: String },
}

/// Generate a key strictly between `before` and `after`.
///
/// Keys are built from `A-Z` and `a-z` only and never end in `A`, so there is
/// always room below any generated key. Bounds may be arbitrary strings and are
/// compared by Unicode scalar value.
///
/// # Errors
/// Returns [`KeyError::InvertedBounds`] when `before >= after` and
/// [`KeyError::NoRoom`] when nothing sorts below `after`.
pub fn key_between(before: Option<&str>, after: Option<&str>) -> Result<String, KeyError> {
    if let (Some(lo), Some(hi)) = (before, after) {
        if lo >= hi {
            return Err(KeyError::InvertedBounds {
                before: lo.to_string(),
                after: hi.to_string(),
            });
        }
    }

    let lo = before.unwrap_or_default().chars().collect::<Vec<_>>();
    let hi = after.map(|after| after.chars().collect::<Vec<_>>());
    // `out` equals hi[..position] while this holds.
    let mut hi_active = hi.is_some();
    let mut out = String::new();

    let mut position = 0;
    loop {
        let lo_char = lo.get(position).copied();
        let hi_char = match (&hi, hi_active) {
            (Some(hi), true) => match hi.get(position) {
                Some(ch) => Some(*ch),
                None => {
                    return Err(KeyError::NoRoom {
                        after: after.unwrap_or_default().to_string(),
                    })
                }
            },
            _ => None,
        };

        let candidates = DIGITS
            .iter()
            .map(|digit| char::from(*digit))
            .filter(|ch| *ch != LOWEST_DIGIT)
            .filter(|ch| !lo_char.is_some_and(|lo_char| *ch <= lo_char))
            .filter(|ch| !hi_char.is_some_and(|hi_char| *ch >= hi_char))
            .collect::<Vec<_>>();

        if !candidates.is_empty() {
            let pick = match (lo_char, hi_char) {
                (None, None) => START_DIGIT,
                (Some(_), None) => candidates[0],
                _ => candidates[candidates.len() / 2],
            };
            out.push(pick);
            return Ok(out);
        }

        match (lo_char, hi_char) {
            (Some(lo_char), hi_char) => {
                out.push(lo_char);
                if hi_char.is_some_and(|hi_char| lo_char < hi_char) {
                    hi_active = false;
                }
            }
            (None, Some(hi_char)) => {
                if LOWEST_DIGIT < hi_char {
                    out.push(LOWEST_DIGIT);
                    hi_active = false;
                } else {
                    out.push(hi_char);
                }
            }
            (None, None) => {
                out.push(START_DIGIT);
                return Ok(out);
            }
        }
        position += 1;
    }
}

/// [`IndexAllocator`] backed by [`key_between`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MidpointAllocator;

impl IndexAllocator for MidpointAllocator {
    fn allocate(
        &self,
        item_id: &str,
        before: Option<&str>,
        after: Option<&str>,
    ) -> Result<String, OrderingError> {
        let before = crate::non_empty(before);
        let after = crate::non_empty(after);
        key_between(before, after).map_err(|err| OrderingError::Allocation {
            item_id: item_id.to_string(),
            reason: err.to_string(),
        })
    }
}
