use crate::error::{self, Result};
use snafu::ensure;

/// One row of a `newuidmap`/`newgidmap` argument list: (inside, outside, count).
pub type IdmapTriple = (u32, u32, u32);

const MAX_ID: u32 = 65535;

/// Derives the uid (or gid) mapping for a container's user namespace.
///
/// Inside id `0` maps to `subordinate_base` (the deployment's subordinate-id
/// root); inside id `caller` maps to itself; every other inside id in
/// `[0, 65535]` is filled linearly from `subordinate_base + 1` onward. No
/// outside id is ever reused.
pub fn derive(caller: u32, subordinate_base: u32) -> Result<Vec<IdmapTriple>> {
    ensure!(
        subordinate_base != caller,
        error::IdmapHoleCollisionSnafu {
            caller,
            subordinate_base
        }
    );

    let mut holes: Vec<u32> = vec![0, caller];
    holes.sort_unstable();
    holes.dedup();

    let mut triples = Vec::with_capacity(holes.len() + 1);
    for &hole in &holes {
        let outside = if hole == 0 { subordinate_base } else { hole };
        triples.push((hole, outside, 1));
    }

    let mut cursor = subordinate_base + 1;
    let mut start = 0u32;
    for &hole in &holes {
        if start < hole {
            let count = hole - start;
            triples.push((start, cursor, count));
            cursor += count;
        }
        start = hole + 1;
    }
    if start <= MAX_ID {
        let count = MAX_ID - start + 1;
        triples.push((start, cursor, count));
    }

    Ok(triples)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn covers_every_inside_id_exactly_once() {
        let triples = derive(1000, 100_000).unwrap();
        let mut seen: HashSet<u32> = HashSet::new();
        let mut outside_seen: HashSet<u32> = HashSet::new();
        for (inside, outside, count) in triples {
            for i in 0..count {
                assert!(seen.insert(inside + i), "inside id mapped twice");
                assert!(outside_seen.insert(outside + i), "outside id mapped twice");
            }
        }
        assert_eq!(seen.len(), (MAX_ID + 1) as usize);
    }

    #[test]
    fn required_holes_are_present() {
        let triples = derive(1000, 100_000).unwrap();
        assert!(triples.contains(&(0, 100_000, 1)));
        assert!(triples.contains(&(1000, 1000, 1)));
    }

    #[test]
    fn rejects_subordinate_base_equal_to_caller() {
        assert!(derive(100_000, 100_000).is_err());
    }
}
