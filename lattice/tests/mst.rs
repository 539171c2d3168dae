// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Borůvka's minimum spanning tree over the runtime: the edge scan is
//! partitioned across units, per-component minima travel through
//! gather/bcast, and the chosen-edge marks are published through a
//! team segment with one-sided puts. The fixture is a 20-vertex weighted
//! multigraph whose spanning tree weighs 39.

mod common;

use lattice::{TeamId, TeamUnit};

const VERTICES: usize = 20;
const TREE_WEIGHT: i32 = 39;

#[rustfmt::skip]
const EDGES: &[(usize, usize, i32)] = &[
    (12, 11, 8), (10, 0, 1), (2, 0, 8), (15, 18, 4), (11, 13, 0),
    (8, 18, 3), (1, 9, 10), (11, 1, 9), (11, 13, 9), (0, 19, 7),
    (19, 17, 6), (2, 5, 3), (18, 16, 6), (10, 9, 3), (16, 11, 10),
    (17, 1, 1), (16, 13, 4), (7, 7, 1), (15, 19, 0), (13, 14, 6),
    (10, 8, 4), (10, 1, 3), (7, 9, 7), (8, 13, 7), (14, 8, 7),
    (16, 11, 4), (0, 3, 10), (13, 10, 7), (17, 7, 7), (15, 10, 8),
    (0, 2, 6), (12, 7, 9), (5, 6, 9), (3, 4, 9), (14, 0, 9),
    (17, 14, 6), (4, 4, 5), (1, 13, 2), (11, 15, 6), (9, 2, 2),
    (0, 1, 5), (0, 2, 7), (0, 3, 3), (0, 5, 7), (0, 6, 9),
    (0, 7, 6), (0, 10, 9), (0, 13, 7), (0, 15, 4), (1, 0, 3),
    (1, 2, 7), (1, 10, 2), (2, 1, 4), (2, 10, 2), (2, 16, 9),
    (3, 0, 4), (3, 2, 0), (5, 0, 1), (5, 2, 3), (5, 7, 5),
    (5, 10, 4), (5, 12, 6), (6, 2, 5), (6, 12, 2), (8, 0, 2),
    (10, 0, 0), (10, 1, 8), (10, 3, 10), (11, 0, 9), (11, 2, 8),
    (11, 7, 10), (11, 10, 10), (12, 0, 8), (12, 1, 4), (13, 1, 10),
    (13, 3, 9), (15, 0, 0), (15, 1, 10), (15, 5, 7), (15, 10, 8),
];

/// Per-component candidate: weight and edge index, `(i32::MAX, -1)` when
/// absent. Ordered lexicographically so ties break deterministically.
type Candidate = (i32, i32);

fn encode_candidates(cands: &[Candidate]) -> Vec<u8> {
    cands
        .iter()
        .flat_map(|(w, e)| {
            let mut bytes = w.to_ne_bytes().to_vec();
            bytes.extend_from_slice(&e.to_ne_bytes());
            bytes
        })
        .collect()
}

fn decode_candidate(bytes: &[u8]) -> Candidate {
    (
        i32::from_ne_bytes(bytes[..4].try_into().unwrap()),
        i32::from_ne_bytes(bytes[4..8].try_into().unwrap()),
    )
}

#[test]
fn boruvka_over_the_runtime() {
    common::run_units(4, |rt| {
        let me = rt.my_unit().get();
        let size = usize::try_from(rt.size()).unwrap();
        let root = TeamUnit::new(0);

        let mut comp: Vec<usize> = (0..VERTICES).collect();
        let mut chosen = vec![false; EDGES.len()];

        loop {
            // each unit scans its slice of the edge list for the
            // cheapest outgoing edge per component
            let mut mine: Vec<Candidate> = vec![(i32::MAX, -1); VERTICES];
            for (idx, &(a, b, w)) in EDGES.iter().enumerate() {
                if idx % size != usize::try_from(me).unwrap() {
                    continue;
                }
                if comp[a] == comp[b] {
                    continue;
                }
                let cand = (w, i32::try_from(idx).unwrap());
                for c in [comp[a], comp[b]] {
                    if cand < mine[c] {
                        mine[c] = cand;
                    }
                }
            }

            // root merges the per-unit minima
            let send = encode_candidates(&mine);
            let mut recv = vec![0u8; send.len() * size];
            rt.gather(TeamId::ALL, root, &send, &mut recv).unwrap();

            let mut done = 0u8;
            if me == 0 {
                let mut best: Vec<Candidate> = vec![(i32::MAX, -1); VERTICES];
                for unit in 0..size {
                    let at = unit * send.len();
                    for c in 0..VERTICES {
                        let cand = decode_candidate(&recv[at + c * 8..at + c * 8 + 8]);
                        if cand < best[c] {
                            best[c] = cand;
                        }
                    }
                }

                let mut merged = false;
                for &(w, e) in &best {
                    if w == i32::MAX {
                        continue;
                    }
                    let (a, b, _) = EDGES[usize::try_from(e).unwrap()];
                    let (ca, cb) = (comp[a], comp[b]);
                    if ca == cb {
                        continue;
                    }
                    chosen[usize::try_from(e).unwrap()] = true;
                    let (keep, fold) = (ca.min(cb), ca.max(cb));
                    for slot in comp.iter_mut() {
                        if *slot == fold {
                            *slot = keep;
                        }
                    }
                    merged = true;
                }

                let components = {
                    let mut seen = vec![false; VERTICES];
                    comp.iter().for_each(|&c| seen[c] = true);
                    seen.iter().filter(|&&s| s).count()
                };
                done = u8::from(components == 1 || !merged);
            }

            // publish the merged component labels and the stop flag
            let mut comp_wire: Vec<u8> = comp
                .iter()
                .flat_map(|&c| u32::try_from(c).unwrap().to_ne_bytes())
                .collect();
            rt.bcast(TeamId::ALL, root, &mut comp_wire).unwrap();
            for (slot, bytes) in comp.iter_mut().zip(comp_wire.chunks_exact(4)) {
                *slot = usize::try_from(u32::from_ne_bytes(bytes.try_into().unwrap())).unwrap();
            }
            let mut flag = [done];
            rt.bcast(TeamId::ALL, root, &mut flag).unwrap();
            if flag[0] == 1 {
                break;
            }
        }

        // the root publishes the chosen-edge marks through a segment;
        // every unit verifies the tree weight from its own copy
        let marks = rt.team_memalloc_aligned(TeamId::ALL, EDGES.len()).unwrap();
        if me == 0 {
            let wire: Vec<u8> = chosen.iter().map(|&c| u8::from(c)).collect();
            for unit in 0..i32::try_from(size).unwrap() {
                rt.rma_put_blocking(TeamId::ALL, marks.with_unit(TeamUnit::new(unit)), &wire)
                    .unwrap();
            }
        }
        rt.barrier(TeamId::ALL).unwrap();

        let local = rt
            .gptr_addr(TeamId::ALL, marks.with_unit(rt.team_my_unit(TeamId::ALL).unwrap()))
            .unwrap();
        // Safety: the segment portion is ours and the writer is past the
        // barrier.
        let wire = unsafe { core::slice::from_raw_parts(local, EDGES.len()) };
        let total: i32 = EDGES
            .iter()
            .zip(wire)
            .filter(|&(_, &marked)| marked == 1)
            .map(|(&(_, _, w), _)| w)
            .sum();
        assert_eq!(total, TREE_WEIGHT);

        rt.barrier(TeamId::ALL).unwrap();
        rt.team_memfree(TeamId::ALL, marks).unwrap();
    });
}
