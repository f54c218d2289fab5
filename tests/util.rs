//! Shared helpers for the integration tests.

#![allow(dead_code)]

use mesh_refine::prelude::*;
use std::collections::HashMap;

pub fn identity_metric(ndims: usize, nnodes: usize) -> Vec<f64> {
    let mut m = Vec::with_capacity(ndims * ndims * nnodes);
    for _ in 0..nnodes {
        for i in 0..ndims {
            for j in 0..ndims {
                m.push(if i == j { 1.0 } else { 0.0 });
            }
        }
    }
    m
}

pub fn live_elements<C: Communicator>(mesh: &Mesh<C>) -> Vec<Vec<i64>> {
    (0..mesh.element_count())
        .filter(|&e| !mesh.is_erased(e))
        .map(|e| mesh.element(e).to_vec())
        .collect()
}

fn signed_measure<C: Communicator>(mesh: &Mesh<C>, elem: &[i64]) -> f64 {
    let x: Vec<&[f64]> = elem.iter().map(|&v| mesh.coords_of(v as Lid)).collect();
    if mesh.dims() == 2 {
        0.5 * ((x[1][0] - x[0][0]) * (x[2][1] - x[0][1])
            - (x[2][0] - x[0][0]) * (x[1][1] - x[0][1]))
    } else {
        let a = [x[1][0] - x[0][0], x[1][1] - x[0][1], x[1][2] - x[0][2]];
        let b = [x[2][0] - x[0][0], x[2][1] - x[0][1], x[2][2] - x[0][2]];
        let c = [x[3][0] - x[0][0], x[3][1] - x[0][1], x[3][2] - x[0][2]];
        (a[0] * (b[1] * c[2] - b[2] * c[1]) - a[1] * (b[0] * c[2] - b[2] * c[0])
            + a[2] * (b[0] * c[1] - b[1] * c[0]))
            / 6.0
    }
}

/// Sum of unsigned element measures (area in 2D, volume in 3D).
pub fn total_measure<C: Communicator>(mesh: &Mesh<C>) -> f64 {
    live_elements(mesh)
        .iter()
        .map(|elem| signed_measure(mesh, elem).abs())
        .sum()
}

/// Every live element must have the same handedness as the first one.
pub fn assert_positive_orientation<C: Communicator>(mesh: &Mesh<C>) {
    let elems = live_elements(mesh);
    let Some(first) = elems.first() else { return };
    let reference = signed_measure(mesh, first).signum();
    for elem in &elems {
        let measure = signed_measure(mesh, elem);
        assert!(
            measure * reference > 0.0,
            "element {elem:?} has measure {measure} against reference sign {reference}"
        );
    }
}

/// No sub-facet (edge in 2D, face in 3D) may be shared by more than two
/// live elements.
pub fn assert_conforming<C: Communicator>(mesh: &Mesh<C>) {
    let mut counts: HashMap<Vec<i64>, usize> = HashMap::new();
    for elem in live_elements(mesh) {
        for skip in 0..elem.len() {
            let mut facet: Vec<i64> = elem
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != skip)
                .map(|(_, &v)| v)
                .collect();
            facet.sort_unstable();
            *counts.entry(facet).or_insert(0) += 1;
        }
    }
    for (facet, count) in counts {
        assert!(count <= 2, "facet {facet:?} shared by {count} elements");
    }
}

/// No vertex may sit strictly inside another live element's edge.
pub fn assert_no_hanging_nodes<C: Communicator>(mesh: &Mesh<C>) {
    const TOL: f64 = 1e-9;
    let ndims = mesh.dims();
    let elems = live_elements(mesh);
    for elem in &elems {
        for j in 0..elem.len() {
            for k in j + 1..elem.len() {
                let a = mesh.coords_of(elem[j] as Lid);
                let b = mesh.coords_of(elem[k] as Lid);
                let len2: f64 = (0..ndims).map(|i| (b[i] - a[i]).powi(2)).sum();
                for w in 0..mesh.vertex_count() {
                    if elem.contains(&(w as i64)) {
                        continue;
                    }
                    let x = mesh.coords_of(w);
                    let t: f64 = (0..ndims)
                        .map(|i| (x[i] - a[i]) * (b[i] - a[i]))
                        .sum::<f64>()
                        / len2;
                    if t <= TOL || t >= 1.0 - TOL {
                        continue;
                    }
                    let dist2: f64 = (0..ndims)
                        .map(|i| (x[i] - (a[i] + t * (b[i] - a[i]))).powi(2))
                        .sum();
                    assert!(
                        dist2 > TOL,
                        "vertex {w} hangs on edge ({}, {}) of element {elem:?}",
                        elem[j],
                        elem[k]
                    );
                }
            }
        }
    }
}

/// Longest metric edge length over the rebuilt adjacency.
pub fn max_metric_edge_length<C: Communicator>(mesh: &Mesh<C>) -> f64 {
    let mut longest = 0.0f64;
    for v in 0..mesh.vertex_count() {
        for &u in mesh.neighbours(v) {
            if u > v {
                longest = longest.max(mesh.calc_edge_length(v, u));
            }
        }
    }
    longest
}
