//! Next/previous track selection over a catalog snapshot.

use crate::error::EngineError;
use deck_proto::protocol::Direction;
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;

/// Position of `current` in `catalog`.  mpv may report a full path, so the
/// basename is tried as well.
pub fn index_of(current: &str, catalog: &[String]) -> Option<usize> {
    if current.is_empty() {
        return None;
    }
    catalog.iter().position(|f| f == current).or_else(|| {
        let base = Path::new(current).file_name()?.to_str()?;
        catalog.iter().position(|f| f == base)
    })
}

/// Pick the file to play after `current`.
///
/// Known current file: neighbour in `direction` with wraparound.  Unknown
/// current file: uniform random pick.  `Random` avoids repeating the current
/// file whenever there is anything else to play.
pub fn select<R: Rng + ?Sized>(
    current: &str,
    catalog: &[String],
    direction: Direction,
    rng: &mut R,
) -> Result<String, EngineError> {
    if catalog.is_empty() {
        return Err(EngineError::NoFilesAvailable);
    }
    let len = catalog.len();
    let idx = index_of(current, catalog);

    let pick = match (direction, idx) {
        (Direction::Next, Some(i)) => &catalog[(i + 1) % len],
        (Direction::Prev, Some(i)) => &catalog[(i + len - 1) % len],
        (Direction::Random, Some(i)) if len > 1 => {
            let offset = rng.gen_range(1..len);
            &catalog[(i + offset) % len]
        }
        _ => catalog.choose(rng).ok_or(EngineError::NoFilesAvailable)?,
    };
    Ok(pick.clone())
}
