//! Two-rank refinement over the shared-memory communicator: shared edges
//! split identically on both sides and the halo is rebuilt for the new
//! vertices.

mod util;

use mesh_refine::prelude::*;
use std::sync::Arc;
use util::*;

const TAG_SHIFT: u16 = 1000;

struct RankResult {
    nnodes: usize,
    live: usize,
    new_coords: Vec<(f64, f64)>,
    send_to_peer: Vec<Lid>,
    recv_from_peer: Vec<Lid>,
    send_halo: Vec<Lid>,
    recv_halo: Vec<Lid>,
}

/// Unit square split along the diagonal BC, partitioned between two ranks:
/// rank 0 owns A, B, C; rank 1 owns D. Both ranks hold both triangles and a
/// ghost copy of the foreign corner. Only the diagonal exceeds the bound.
fn run_rank(rank: usize) -> RankResult {
    let comm = Arc::new(RayonComm::with_tag_shift(rank, 2, TAG_SHIFT));
    let (coords, enlist, send, recv) = if rank == 0 {
        (
            // A(0,0) B(1,0) C(0,1) D(1,1)-ghost
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            vec![0, 1, 2, 1, 3, 2],
            vec![vec![], vec![1, 2]],
            vec![vec![], vec![3]],
        )
    } else {
        (
            // B(1,0)-ghost C(0,1)-ghost D(1,1)
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            vec![0, 2, 1],
            vec![vec![2], vec![]],
            vec![vec![0, 1], vec![]],
        )
    };
    let nnodes = coords.len() / 2;
    let mut mesh = Mesh::with_halo(
        2,
        coords,
        identity_metric(2, nnodes),
        enlist,
        send,
        recv,
        comm,
    )
    .unwrap();
    let mut surface = Surface::empty(2).unwrap();
    Refine::new(&mut mesh, &mut surface)
        .unwrap()
        .refine(1.2)
        .unwrap();

    let peer = 1 - rank;
    RankResult {
        nnodes: mesh.vertex_count(),
        live: live_elements(&mesh).len(),
        new_coords: (nnodes..mesh.vertex_count())
            .map(|v| {
                let x = mesh.coords_of(v);
                (x[0], x[1])
            })
            .collect(),
        send_to_peer: mesh.send_list(peer).to_vec(),
        recv_from_peer: mesh.recv_list(peer).to_vec(),
        send_halo: mesh.send_halo().iter().copied().collect(),
        recv_halo: mesh.recv_halo().iter().copied().collect(),
    }
}

#[test]
fn shared_diagonal_splits_on_both_ranks() {
    let t0 = std::thread::spawn(|| run_rank(0));
    let t1 = std::thread::spawn(|| run_rank(1));
    let r0 = t0.join().unwrap();
    let r1 = t1.join().unwrap();

    // Rank 0 held 4 vertices and both triangles; the diagonal midpoint is
    // its fifth vertex and both triangles split in two.
    assert_eq!(r0.nnodes, 5);
    assert_eq!(r0.live, 4);
    assert_eq!(r0.new_coords, vec![(0.5, 0.5)]);

    // Rank 1 held 3 vertices and one triangle.
    assert_eq!(r1.nnodes, 4);
    assert_eq!(r1.live, 2);
    assert_eq!(r1.new_coords, vec![(0.5, 0.5)]);

    // Both endpoints of the split edge are owned by rank 0, so the new
    // vertex is rank 0's to send and rank 1's to receive.
    assert_eq!(r0.send_to_peer, vec![1, 2, 4]);
    assert_eq!(r0.recv_from_peer, vec![3]);
    assert!(r0.send_halo.contains(&4));

    assert_eq!(r1.send_to_peer, vec![2]);
    assert_eq!(r1.recv_from_peer, vec![0, 1, 3]);
    assert!(r1.recv_halo.contains(&3));

    // Halo round-trip: the appended send and recv entries pair up.
    assert_eq!(
        r0.send_to_peer.len() - 2,
        r1.recv_from_peer.len() - 2,
        "appended halo entries must pair up"
    );
}

#[test]
fn partitioning_does_not_change_the_split_set() {
    // The same square refined serially splits exactly one edge, at the same
    // geometric location as the distributed run.
    let mut mesh = Mesh::new(
        2,
        vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        identity_metric(2, 4),
        vec![0, 1, 2, 1, 3, 2],
        Arc::new(NoComm),
    )
    .unwrap();
    let mut surface = Surface::empty(2).unwrap();
    Refine::new(&mut mesh, &mut surface)
        .unwrap()
        .refine(1.2)
        .unwrap();

    assert_eq!(mesh.vertex_count(), 5);
    let x = mesh.coords_of(4);
    assert_eq!((x[0], x[1]), (0.5, 0.5));
    assert_eq!(live_elements(&mesh).len(), 4);
}
