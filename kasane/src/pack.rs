//! Mapping the keyword trie into the `base`/`check` double array, then
//! compiling failure links and output tables over the packed slots.

use std::{cmp, collections::VecDeque};

use itertools::Itertools;
use snafu::ensure;
use tracing::trace;

use crate::{
    trie::{NodeId, Trie},
    CapacityError, Result,
};

// one code-unit page; growth handles everything past it
const INITIAL_SLOTS: usize = 65536;
// scan probes reach up to base[s] + 65535 + 1, so keep a unit range of slack
const TAIL_SLACK: usize = 65535;
// hard ceiling on the slot address space
const MAX_SLOTS: usize = (i32::MAX / 100 * 95) as usize;

/// The immutable product of packing: everything the scanner needs.
pub(crate) struct Packed {
    pub(crate) base: Vec<i32>,
    pub(crate) check: Vec<i32>,
    pub(crate) fail: Vec<i32>,
    pub(crate) output: Vec<Option<Box<[i32]>>>,
    pub(crate) size: usize,
}

/// One entry of an ordered sibling group. Offsets are `unit + 1`; offset 0
/// is the synthetic terminal marker of an accepting parent, whose cell
/// stores `-(largest emit) - 1` and doubles as the exact-match value.
enum Sibling {
    Terminal { emit: i32 },
    Child(NodeId),
}

fn sibling_group(trie: &Trie, id: NodeId) -> Vec<(usize, Sibling)> {
    let node = trie.node(id);
    let mut group = Vec::with_capacity(node.children.len() + 1);
    if let Some(emit) = node.largest_emit() {
        group.push((0, Sibling::Terminal { emit }));
    }
    group.extend(
        node.children
            .iter()
            .map(|(&unit, &child)| (unit as usize + 1, Sibling::Child(child))),
    );
    group
}

pub(crate) fn pack(trie: &Trie, key_count: usize) -> Result<Packed> {
    let mut packer = Packer::new(key_count);
    let mut slots = vec![0usize; trie.node_count()];

    // breadth-first over parents; recursion depth would otherwise track the
    // longest common prefix
    let mut queue = VecDeque::new();
    queue.push_back(Trie::ROOT);
    while let Some(id) = queue.pop_front() {
        let group = sibling_group(trie, id);
        if group.is_empty() {
            // only the root of an empty dictionary
            continue;
        }
        let begin = packer.place(&group)?;
        packer.base[slots[id]] = begin as i32;
        for &(offset, ref sibling) in &group {
            match *sibling {
                Sibling::Terminal { emit } => {
                    packer.base[begin + offset] = -emit - 1;
                    packer.progress += 1;
                }
                Sibling::Child(child) => {
                    slots[child] = begin + offset;
                    queue.push_back(child);
                }
            }
        }
    }

    packer.lose_weight();
    trace!(
        "packed {} keywords into {} slots ({} allocated)",
        key_count,
        packer.size,
        packer.base.len()
    );

    let (fail, output) = compile_links(trie, &slots, &packer.base, &packer.check, packer.size);
    Ok(Packed {
        base: packer.base,
        check: packer.check,
        fail,
        output,
        size: packer.size,
    })
}

struct Packer {
    base: Vec<i32>,
    check: Vec<i32>,
    used: Vec<bool>,
    alloc: usize,
    size: usize,
    next_check_pos: usize,
    progress: usize,
    key_count: usize,
}

impl Packer {
    fn new(key_count: usize) -> Packer {
        let mut packer = Packer {
            base: Vec::new(),
            check: Vec::new(),
            used: Vec::new(),
            alloc: 0,
            size: 0,
            next_check_pos: 0,
            progress: 0,
            key_count,
        };
        packer.resize(INITIAL_SLOTS);
        packer
    }

    fn resize(&mut self, new_len: usize) {
        self.base.resize(new_len, 0);
        self.check.resize(new_len, 0);
        self.used.resize(new_len, false);
        self.alloc = new_len;
    }

    fn grow(&mut self, at_least: usize) -> Result<()> {
        ensure!(
            at_least <= MAX_SLOTS,
            CapacityError {
                requested: at_least
            }
        );
        let factor = cmp::max(105, self.key_count * 100 / (self.progress + 1));
        let next = cmp::min(cmp::max(at_least, self.alloc * factor / 100), MAX_SLOTS);
        trace!("double array grows {} -> {}", self.alloc, next);
        self.resize(next);
        Ok(())
    }

    /// Search out a `begin` whose cells are free for every offset of the
    /// group, then stamp ownership into `check`.
    fn place(&mut self, group: &[(usize, Sibling)]) -> Result<usize> {
        let first = group[0].0;
        let last = group[group.len() - 1].0;

        let mut pos = cmp::max(first + 1, self.next_check_pos) - 1;
        let mut nonzero = 0usize;
        let mut seen_free = false;
        let begin = 'search: loop {
            pos += 1;
            if self.alloc <= pos {
                self.grow(pos + 1)?;
            }
            if self.check[pos] != 0 {
                nonzero += 1;
                continue;
            }
            if !seen_free {
                // first hole of this search; later searches start here
                self.next_check_pos = pos;
                seen_free = true;
            }
            let begin = pos - first;
            if self.alloc <= begin + last {
                self.grow(begin + last + 1)?;
            }
            // a begin may own at most one sibling group
            if self.used[begin] {
                continue;
            }
            for &(offset, _) in &group[1..] {
                if self.check[begin + offset] != 0 {
                    continue 'search;
                }
            }
            break begin;
        };

        // the stretch we walked was nearly full; skip it from now on
        if nonzero as f32 / (pos - self.next_check_pos + 1) as f32 >= 0.95 {
            self.next_check_pos = pos;
        }

        self.used[begin] = true;
        for &(offset, _) in group {
            self.check[begin + offset] = begin as i32;
        }
        self.size = cmp::max(self.size, begin + last + 1);
        Ok(begin)
    }

    /// Shrink to the final footprint, keeping zeroed slack past the last
    /// live slot so the scanner's probes stay in range.
    fn lose_weight(&mut self) {
        let n = self.size + TAIL_SLACK;
        self.base.resize(n, 0);
        self.check.resize(n, 0);
        self.used = Vec::new();
        self.alloc = n;
    }
}

/// One packed-automaton step. `None` means the transition is absent and the
/// caller should chase the failure link; the root eats every miss.
pub(crate) fn transition_with_root(
    base: &[i32],
    check: &[i32],
    s: usize,
    unit: u16,
) -> Option<usize> {
    let b = base[s];
    debug_assert!(b >= 0, "stepped from a terminal cell");
    let p = b as usize + unit as usize + 1;
    if check.get(p) == Some(&b) {
        Some(p)
    } else if s == 0 {
        Some(0)
    } else {
        None
    }
}

/// Breadth-first failure-link and output-table construction over the packed
/// arrays. Children of the root fail to the root; every deeper state chases
/// its parent's failure chain, then folds the target's output into its own.
fn compile_links(
    trie: &Trie,
    slots: &[usize],
    base: &[i32],
    check: &[i32],
    size: usize,
) -> (Vec<i32>, Vec<Option<Box<[i32]>>>) {
    let mut fail = vec![0i32; size + 1];
    let mut output: Vec<Option<Box<[i32]>>> = vec![None; size + 1];

    let mut queue = VecDeque::new();
    for &child in trie.node(Trie::ROOT).children.values() {
        let slot = slots[child];
        fail[slot] = 0;
        let emits = &trie.node(child).emits;
        if !emits.is_empty() {
            output[slot] = Some(emits.clone().into_boxed_slice());
        }
        queue.push_back(child);
    }

    while let Some(id) = queue.pop_front() {
        let slot = slots[id];
        for (&unit, &child) in &trie.node(id).children {
            let child_slot = slots[child];
            let mut from = fail[slot] as usize;
            let target = loop {
                match transition_with_root(base, check, from, unit) {
                    Some(t) => break t,
                    None => from = fail[from] as usize,
                }
            };
            fail[child_slot] = target as i32;

            // the fail target is strictly shallower, so by breadth-first
            // order its output is already final; one merge inherits the
            // whole suffix chain
            let inherited = output[target].as_deref().unwrap_or(&[]);
            let merged: Vec<i32> = trie
                .node(child)
                .emits
                .iter()
                .merge_by(inherited.iter(), |a, b| a >= b)
                .dedup()
                .copied()
                .collect();
            if !merged.is_empty() {
                output[child_slot] = Some(merged.into_boxed_slice());
            }
            queue.push_back(child);
        }
    }

    (fail, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_trie(keys: &[&str]) -> Trie {
        let mut trie = Trie::new();
        for (i, key) in keys.iter().enumerate() {
            trie.insert(key.encode_utf16(), i as i32);
        }
        trie
    }

    /// Follow `key` through the packed transitions, asserting each edge.
    fn state_of(packed: &Packed, key: &str) -> usize {
        let mut slot = 0usize;
        for unit in key.encode_utf16() {
            let b = packed.base[slot];
            let p = b as usize + unit as usize + 1;
            assert_eq!(packed.check[p], b, "missing transition in {key:?}");
            slot = p;
        }
        slot
    }

    fn leaf_value(packed: &Packed, key: &str) -> i32 {
        let slot = state_of(packed, key);
        let b = packed.base[slot];
        assert_eq!(packed.check[b as usize], b);
        let n = packed.base[b as usize];
        assert!(n < 0, "{key:?} does not end at an accepting cell");
        -n - 1
    }

    #[test]
    fn packed_transitions_satisfy_the_check_identity() {
        let keys = ["he", "she", "his", "hers", "日本語"];
        let trie = build_trie(&keys);
        let packed = pack(&trie, keys.len()).unwrap();

        let mut stack = vec![(Trie::ROOT, 0usize)];
        while let Some((id, slot)) = stack.pop() {
            let b = packed.base[slot];
            for (&unit, &child) in &trie.node(id).children {
                let p = b as usize + unit as usize + 1;
                assert_eq!(packed.check[p], b);
                stack.push((child, p));
            }
            if trie.node(id).accepts() {
                assert_eq!(packed.check[b as usize], b);
                assert!(packed.base[b as usize] < 0);
            }
        }
    }

    #[test]
    fn leaf_cells_carry_the_keyword_index() {
        let keys = ["he", "she", "his", "hers"];
        let trie = build_trie(&keys);
        let packed = pack(&trie, keys.len()).unwrap();

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(leaf_value(&packed, key), i as i32);
        }
    }

    #[test]
    fn duplicate_keys_resolve_to_the_largest_index() {
        let keys = ["ab", "cd", "ab"];
        let trie = build_trie(&keys);
        let packed = pack(&trie, keys.len()).unwrap();
        assert_eq!(leaf_value(&packed, "ab"), 2);
        assert_eq!(leaf_value(&packed, "cd"), 1);
    }

    #[test]
    fn failure_links_point_at_the_longest_proper_suffix() {
        let keys = ["he", "she", "his", "hers"];
        let trie = build_trie(&keys);
        let packed = pack(&trie, keys.len()).unwrap();

        // depth 1 fails to the root
        assert_eq!(packed.fail[state_of(&packed, "h")], 0);
        assert_eq!(packed.fail[state_of(&packed, "s")], 0);
        // "sh" falls back to "h", "she" to "he"
        assert_eq!(
            packed.fail[state_of(&packed, "sh")],
            state_of(&packed, "h") as i32
        );
        assert_eq!(
            packed.fail[state_of(&packed, "she")],
            state_of(&packed, "he") as i32
        );

        // "she" reports she(1) and the inherited he(0), largest first
        let out = packed.output[state_of(&packed, "she")].as_deref();
        assert_eq!(out, Some(&[1, 0][..]));
        // "her" accepts nothing itself and inherits nothing
        assert_eq!(packed.output[state_of(&packed, "her")], None);
    }

    #[test]
    fn packing_is_deterministic() {
        let keys = ["dolor", "sit", "amet", "it", "do"];
        let a = pack(&build_trie(&keys), keys.len()).unwrap();
        let b = pack(&build_trie(&keys), keys.len()).unwrap();
        assert_eq!(a.base, b.base);
        assert_eq!(a.check, b.check);
        assert_eq!(a.fail, b.fail);
        assert_eq!(a.size, b.size);
    }

    #[test]
    fn empty_trie_packs_to_nothing() {
        let packed = pack(&Trie::new(), 0).unwrap();
        assert_eq!(packed.size, 0);
        assert!(packed.check.iter().all(|&c| c == 0));
        assert_eq!(packed.fail.len(), 1);
        assert_eq!(packed.output.len(), 1);
    }

    #[test]
    fn high_code_units_force_growth_and_still_resolve() {
        let keys = ["\u{ffff}\u{fffe}", "a", "\u{ffff}a"];
        let trie = build_trie(&keys);
        let packed = pack(&trie, keys.len()).unwrap();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(leaf_value(&packed, key), i as i32);
        }
    }
}
