//! Position maps and their composition.
//!
//! A [`StepMap`] records how one step moves positions as a list of replaced
//! ranges. A [`Mapping`] chains step maps in chronological order and keeps
//! *mirror* pairs: when a map and its inverse both appear in a mapping, a
//! position swallowed by the inverse is recovered exactly by its mirror
//! instead of collapsing onto the edge of the deleted range.
//!
//! ```text
//!   Mapping:  [ inv(s2) ][ inv(s1) ][ over... ][ s1' ][ s2' ]
//!                  │          └─────── mirror ───┘      │
//!                  └──────────────── mirror ────────────┘
//! ```

use serde::{Deserialize, Serialize};

/// Which side a position sticks to when content is inserted exactly there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Before,
    After,
}

const DEL_BEFORE: u8 = 1;
const DEL_AFTER: u8 = 2;
const DEL_ACROSS: u8 = 4;
const DEL_SIDE: u8 = 8;

/// Index of a replaced range plus the offset into it, used for mirror recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recover {
    pub index: usize,
    pub offset: usize,
}

/// The mapped position plus deletion information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    del_info: u8,
    recover: Option<Recover>,
}

impl MapResult {
    fn unchanged(pos: usize) -> Self {
        Self {
            pos,
            del_info: 0,
            recover: None,
        }
    }

    /// The content on the side the position is associated with was deleted.
    pub fn deleted(&self) -> bool {
        self.del_info & DEL_SIDE > 0
    }

    pub fn deleted_before(&self) -> bool {
        self.del_info & (DEL_BEFORE | DEL_ACROSS) > 0
    }

    pub fn deleted_after(&self) -> bool {
        self.del_info & (DEL_AFTER | DEL_ACROSS) > 0
    }

    /// The position was strictly inside a deleted range.
    pub fn deleted_across(&self) -> bool {
        self.del_info & DEL_ACROSS > 0
    }
}

/// One replaced range: `old_size` positions at `start` became `new_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRange {
    pub start: usize,
    pub old_size: usize,
    pub new_size: usize,
}

/// Position map of a single step. Ranges are sorted and non-overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMap {
    ranges: Vec<MapRange>,
}

impl StepMap {
    pub fn new(ranges: Vec<MapRange>) -> Self {
        let ranges = ranges
            .into_iter()
            .filter(|r| r.old_size != 0 || r.new_size != 0)
            .collect();
        Self { ranges }
    }

    /// A map that moves nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(start: usize, old_size: usize, new_size: usize) -> Self {
        Self::new(vec![MapRange {
            start,
            old_size,
            new_size,
        }])
    }

    pub fn ranges(&self) -> &[MapRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut diff: isize = 0;
        for (index, range) in self.ranges.iter().enumerate() {
            let start = range.start;
            if start > pos {
                break;
            }
            let end = start + range.old_size;
            if pos <= end {
                let stick_after = if range.old_size == 0 {
                    assoc == Assoc::After
                } else if pos == start {
                    false
                } else if pos == end {
                    true
                } else {
                    assoc == Assoc::After
                };
                let base = (start as isize + diff) as usize;
                let mapped = if stick_after { base + range.new_size } else { base };

                let edge = if assoc == Assoc::Before { start } else { end };
                let recover = (pos != edge).then_some(Recover {
                    index,
                    offset: pos - start,
                });

                // A pure insertion deletes nothing on either side.
                let mut del_info = 0;
                if range.old_size > 0 {
                    del_info = if pos == start {
                        DEL_AFTER
                    } else if pos == end {
                        DEL_BEFORE
                    } else {
                        DEL_ACROSS
                    };
                    let side_deleted = match assoc {
                        Assoc::Before => pos != start,
                        Assoc::After => pos != end,
                    };
                    if side_deleted {
                        del_info |= DEL_SIDE;
                    }
                }
                return MapResult {
                    pos: mapped,
                    del_info,
                    recover,
                };
            }
            diff += range.new_size as isize - range.old_size as isize;
        }
        MapResult::unchanged((pos as isize + diff) as usize)
    }

    /// Position of a recovered offset within range `index`, in this map's
    /// output coordinates.
    pub fn recover(&self, recover: Recover) -> usize {
        let diff: isize = self.ranges[..recover.index]
            .iter()
            .map(|r| r.new_size as isize - r.old_size as isize)
            .sum();
        let start = self.ranges[recover.index].start as isize;
        (start + diff) as usize + recover.offset
    }

    /// The map that undoes this one. Starts are re-expressed in the output
    /// coordinates of `self`.
    pub fn invert(&self) -> StepMap {
        let mut diff: isize = 0;
        let mut ranges = Vec::with_capacity(self.ranges.len());
        for range in &self.ranges {
            ranges.push(MapRange {
                start: (range.start as isize + diff) as usize,
                old_size: range.new_size,
                new_size: range.old_size,
            });
            diff += range.new_size as isize - range.old_size as isize;
        }
        StepMap { ranges }
    }
}

// ─── Mapping ────────────────────────────────────────────────────────────────

/// An ordered pipeline of step maps.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    maps: Vec<StepMap>,
    mirrors: Vec<(usize, usize)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_maps(maps: impl IntoIterator<Item = StepMap>) -> Self {
        Self {
            maps: maps.into_iter().collect(),
            mirrors: Vec::new(),
        }
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Appends a map. `mirror_of` names an earlier map this one undoes (or
    /// redoes).
    pub fn append_map(&mut self, map: StepMap, mirror_of: Option<usize>) {
        self.maps.push(map);
        if let Some(other) = mirror_of {
            self.set_mirror(other, self.maps.len() - 1);
        }
    }

    pub fn append_mapping(&mut self, other: &Mapping) {
        let start = self.maps.len();
        for (i, map) in other.maps.iter().enumerate() {
            let mirror = other.mirror(i).filter(|&m| m < i).map(|m| start + m);
            self.append_map(map.clone(), mirror);
        }
    }

    /// Appends the inverse of `other`, last map first.
    pub fn append_mapping_inverted(&mut self, other: &Mapping) {
        let total = self.maps.len() + other.maps.len();
        for i in (0..other.maps.len()).rev() {
            let mirror = other.mirror(i).filter(|&m| m > i).map(|m| total - m - 1);
            self.append_map(other.maps[i].invert(), mirror);
        }
    }

    pub fn invert(&self) -> Mapping {
        let mut inverse = Mapping::new();
        inverse.append_mapping_inverted(self);
        inverse
    }

    /// The tail of this mapping starting at map `from`.
    pub fn slice(&self, from: usize) -> Mapping {
        let from = from.min(self.maps.len());
        Mapping {
            maps: self.maps[from..].to_vec(),
            mirrors: self
                .mirrors
                .iter()
                .filter(|(a, b)| *a >= from && *b >= from)
                .map(|(a, b)| (a - from, b - from))
                .collect(),
        }
    }

    pub fn set_mirror(&mut self, a: usize, b: usize) {
        self.mirrors.push((a, b));
    }

    pub fn mirror(&self, n: usize) -> Option<usize> {
        self.mirrors.iter().find_map(|&(a, b)| {
            if a == n {
                Some(b)
            } else if b == n {
                Some(a)
            } else {
                None
            }
        })
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut pos = pos;
        let mut del_info = 0;
        let mut i = 0;
        while i < self.maps.len() {
            let result = self.maps[i].map_result(pos, assoc);
            if let Some(recover) = result.recover {
                if let Some(corr) = self.mirror(i).filter(|&c| c > i) {
                    pos = self.maps[corr].recover(recover);
                    i = corr + 1;
                    continue;
                }
            }
            del_info |= result.del_info;
            pos = result.pos;
            i += 1;
        }
        MapResult {
            pos,
            del_info,
            recover: None,
        }
    }
}
